//! Undo buffer — holds the most recent blocks back until enough later blocks
//! confirm them.
//!
//! With the buffer active the store never sees a reversible block: a block
//! leaves the buffer only once `capacity` newer blocks arrived, and undo
//! signals are absorbed by dropping buffered blocks.

use std::collections::VecDeque;

use crate::error::{Result, SinkError};
use crate::types::BlockScopedData;

#[derive(Debug)]
pub struct UndoBuffer {
    capacity: usize,
    blocks: VecDeque<BlockScopedData>,
    /// Highest block number handed out so far.
    last_released: Option<u64>,
}

impl UndoBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            blocks: VecDeque::with_capacity(capacity + 1),
            last_released: None,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Buffer `data` and return the blocks that are now confirmed, oldest
    /// first. Released blocks are marked final.
    pub fn push(&mut self, data: BlockScopedData) -> Vec<BlockScopedData> {
        self.blocks.push_back(data);

        let mut released = Vec::new();
        while self.blocks.len() > self.capacity {
            if let Some(mut block) = self.blocks.pop_front() {
                block.final_block_height = block.final_block_height.max(block.clock.number);
                self.last_released = Some(block.clock.number);
                released.push(block);
            }
        }
        released
    }

    /// Drop every buffered block above `last_valid_block`.
    ///
    /// Fails when the undo reaches a block that was already released.
    pub fn undo(&mut self, last_valid_block: u64) -> Result<usize> {
        if let Some(released) = self.last_released {
            if last_valid_block < released {
                return Err(SinkError::Undo {
                    last_valid_block,
                    reason: format!(
                        "undo buffer already released block #{released}; increase the undo buffer size"
                    ),
                });
            }
        }
        let before = self.blocks.len();
        self.blocks.retain(|b| b.clock.number <= last_valid_block);
        Ok(before - self.blocks.len())
    }
}
