// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

/// Holds results that completed ahead of their predecessors.
///
/// Entries are released strictly in sequence order: [`ReorderBuffer::pop_ready`]
/// only yields once the next expected sequence number has been inserted.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    pending: BTreeMap<u64, T>,
    next: u64,
}

impl<T> ReorderBuffer<T> {
    pub fn new(first: u64) -> Self {
        ReorderBuffer {
            pending: BTreeMap::new(),
            next: first,
        }
    }

    /// Stores the result for `seq`. Returns `false` if `seq` was already
    /// released or is already buffered, in which case `value` is dropped.
    pub fn insert(&mut self, seq: u64, value: T) -> bool {
        if seq < self.next || self.pending.contains_key(&seq) {
            return false;
        }
        self.pending.insert(seq, value);
        true
    }

    /// Releases the next result if it is present.
    pub fn pop_ready(&mut self) -> Option<(u64, T)> {
        let value = self.pending.remove(&self.next)?;
        let seq = self.next;
        self.next += 1;
        Some((seq, value))
    }

    pub fn next_expected(&self) -> u64 {
        self.next
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
