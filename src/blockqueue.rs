use log::warn;

use crate::block::Block;
use crate::constants::MAX_QUEUE;
use crate::errors::QueueFull;

/// Fixed-capacity FIFO of inbound blocks. When full, the newest block is
/// dropped. No locking of its own; the node keeps it behind a mutex.
#[derive(Debug)]
pub struct BlockQueue {
    slots: Vec<Option<Block>>,
    head: usize,
    tail: usize,
    count: usize,
}

impl Default for BlockQueue {
    fn default() -> Self {
        BlockQueue::new(MAX_QUEUE)
    }
}

impl BlockQueue {
    pub fn new(capacity: usize) -> BlockQueue {
        // a zero capacity queue would drop everything
        let capacity = capacity.max(1);
        BlockQueue {
            slots: vec![None; capacity],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    pub fn push(&mut self, b: Block) -> Result<(), QueueFull> {
        if self.is_full() {
            warn!("block queue full, dropping block {}", b.sequence_number);
            return Err(QueueFull);
        }
        self.slots[self.tail] = Some(b);
        self.tail = (self.tail + 1) % self.slots.len();
        self.count += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Block> {
        if self.count == 0 {
            return None;
        }
        let b = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.count -= 1;
        b
    }
}
