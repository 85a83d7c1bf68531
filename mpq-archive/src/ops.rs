//! The deferred operation log
//!
//! Mutations never touch the container directly; each add or delete pushes
//! an operation carrying everything needed to realize it at save time and to
//! restore the in-memory tables byte-for-byte on undo. A per-slot index maps
//! each hash position to its most recent pending operation for O(1)
//! duplicate-target detection.

use crate::datasource::DataSourceProxy;
use crate::tables::{BlockEntry, HashEntry};
use std::collections::HashMap;

/// State saved for undo and used during realization
#[derive(Debug, Clone)]
pub struct FileContext {
    /// Hash slot the operation targets
    pub hash_position: u32,
    /// Hash entry as it was before the operation
    pub saved_hash_entry: HashEntry,
    /// Block entry as it was before the operation
    pub saved_block_entry: BlockEntry,
    /// Block slot the operation targets
    pub block_index: u32,
    /// Base encryption key (offset adjustment happens at realization)
    pub encryption_key: u32,
    /// Archive path of the file
    pub filename: String,
    /// Filename-table entry for the slot before the operation
    pub saved_filename: Option<String>,
}

/// What a pending operation will do at save time
#[derive(Debug)]
pub enum OperationKind {
    /// Realize a new file from its payload source
    Add {
        /// Where the payload comes from at save time
        source: DataSourceProxy,
        /// Codec mask chosen for the file
        compressor: u8,
        /// Codec-specific quality level
        quality: i32,
    },
    /// The slot was released; nothing to realize
    Delete,
}

/// One pending operation
#[derive(Debug)]
pub struct Operation {
    /// What to do
    pub kind: OperationKind,
    /// Saved state and realization parameters
    pub context: FileContext,
    /// Index of the previous pending operation on the same slot
    prior_in_slot: Option<usize>,
}

impl Operation {
    /// Check if this operation is an add
    pub fn is_add(&self) -> bool {
        matches!(self.kind, OperationKind::Add { .. })
    }
}

/// Ordered log of pending operations
#[derive(Debug, Default)]
pub struct OperationLog {
    ops: Vec<Operation>,
    latest_by_slot: HashMap<u32, usize>,
}

impl OperationLog {
    /// An empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation
    pub fn push(&mut self, kind: OperationKind, context: FileContext) {
        let slot = context.hash_position;
        let prior_in_slot = self.latest_by_slot.get(&slot).copied();
        let index = self.ops.len();
        self.ops.push(Operation {
            kind,
            context,
            prior_in_slot,
        });
        self.latest_by_slot.insert(slot, index);
    }

    /// Pop the most recent operation, fixing up the per-slot index
    pub fn pop(&mut self) -> Option<Operation> {
        let op = self.ops.pop()?;
        let slot = op.context.hash_position;
        match op.prior_in_slot {
            Some(previous) => {
                self.latest_by_slot.insert(slot, previous);
            }
            None => {
                self.latest_by_slot.remove(&slot);
            }
        }
        Some(op)
    }

    /// Most recent pending operation on a hash slot
    pub fn latest_for_slot(&self, hash_position: u32) -> Option<&Operation> {
        self.latest_by_slot
            .get(&hash_position)
            .map(|&index| &self.ops[index])
    }

    /// Log index of the most recent pending operation on a hash slot
    pub fn latest_index_for_slot(&self, hash_position: u32) -> Option<usize> {
        self.latest_by_slot.get(&hash_position).copied()
    }

    /// Operation at a log index
    pub fn get(&self, index: usize) -> Option<&Operation> {
        self.ops.get(index)
    }

    /// All pending operations in submission order
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    /// Number of pending operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check for an empty log
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drop every pending operation (after a successful save)
    pub fn clear(&mut self) {
        self.ops.clear();
        self.latest_by_slot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(slot: u32, name: &str) -> FileContext {
        FileContext {
            hash_position: slot,
            saved_hash_entry: HashEntry::empty(),
            saved_block_entry: BlockEntry::default(),
            block_index: slot,
            encryption_key: 0,
            filename: name.to_string(),
            saved_filename: None,
        }
    }

    #[test]
    fn test_push_pop_order() {
        let mut log = OperationLog::new();
        log.push(OperationKind::Delete, context(1, "a"));
        log.push(OperationKind::Delete, context(2, "b"));

        assert_eq!(log.len(), 2);
        assert_eq!(log.pop().unwrap().context.filename, "b");
        assert_eq!(log.pop().unwrap().context.filename, "a");
        assert!(log.pop().is_none());
    }

    #[test]
    fn test_latest_per_slot_tracks_stacked_ops() {
        let mut log = OperationLog::new();
        log.push(OperationKind::Delete, context(7, "first"));
        log.push(
            OperationKind::Add {
                source: DataSourceProxy::from_data(&b"x"[..]),
                compressor: 0,
                quality: -1,
            },
            context(7, "second"),
        );

        assert!(log.latest_for_slot(7).unwrap().is_add());

        // Popping restores the previous op as the slot's latest
        log.pop();
        assert_eq!(log.latest_for_slot(7).unwrap().context.filename, "first");
        log.pop();
        assert!(log.latest_for_slot(7).is_none());
    }

    #[test]
    fn test_clear_empties_the_index() {
        let mut log = OperationLog::new();
        log.push(OperationKind::Delete, context(3, "x"));
        log.clear();
        assert!(log.is_empty());
        assert!(log.latest_for_slot(3).is_none());
    }
}
