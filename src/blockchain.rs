use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::block::Block;
use crate::wallet::PublicKey;

/// email -> public key, the replay of every accepted transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDatabase {
    keys: HashMap<String, PublicKey>,
}

impl KeyDatabase {
    pub fn new() -> KeyDatabase {
        KeyDatabase::default()
    }

    pub fn get(&self, email: &str) -> Option<&PublicKey> {
        self.keys.get(email)
    }

    pub fn contains(&self, email: &str) -> bool {
        self.keys.contains_key(email)
    }

    pub fn insert(&mut self, email: String, key: PublicKey) -> Option<PublicKey> {
        self.keys.insert(email, key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// The chain map together with the key database projected from it. Both are
/// only ever mutated together, behind the node's chain lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blockchain {
    blocks: BTreeMap<u64, Block>,
    database: KeyDatabase,
}

impl Default for Blockchain {
    fn default() -> Self {
        Blockchain::new()
    }
}

impl Blockchain {
    pub fn new() -> Blockchain {
        let mut blocks = BTreeMap::new();
        blocks.insert(0, Block::genesis());
        Blockchain {
            blocks,
            database: KeyDatabase::new(),
        }
    }

    pub fn get(&self, seq: u64) -> Option<&Block> {
        self.blocks.get(&seq)
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.blocks.contains_key(&seq)
    }

    pub fn tip(&self) -> &Block {
        // genesis is never removed
        self.blocks
            .values()
            .next_back()
            .unwrap_or_else(|| unreachable!("chain lost its genesis block"))
    }

    pub fn height(&self) -> u64 {
        self.tip().sequence_number
    }

    /// Highest block strictly below `seq`.
    pub fn highest_below(&self, seq: u64) -> Option<&Block> {
        self.blocks.range(..seq).next_back().map(|(_, b)| b)
    }

    /// Stores a block that has already been validated against this chain.
    pub fn insert(&mut self, block: Block) {
        debug!("insert block {} {}", block.sequence_number, block.get_hash());
        self.blocks.insert(block.sequence_number, block);
    }

    /// Drops every block above `seq`. The database is left untouched; the
    /// caller rebuilds it.
    pub fn truncate_above(&mut self, seq: u64) -> usize {
        match seq.checked_add(1) {
            Some(first) => self.blocks.split_off(&first).len(),
            None => 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn database(&self) -> &KeyDatabase {
        &self.database
    }

    pub fn database_mut(&mut self) -> &mut KeyDatabase {
        &mut self.database
    }

    pub fn replace_database(&mut self, database: KeyDatabase) {
        self.database = database;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blockchain_starts_at_genesis() {
        let bc = Blockchain::new();
        assert_eq!(bc.len(), 1);
        assert_eq!(bc.height(), 0);
        assert_eq!(bc.tip(), &Block::genesis());
        assert!(bc.database().is_empty());
    }

    #[test]
    fn test_truncate_and_highest_below() {
        let mut bc = Blockchain::new();
        for seq in 1..=4 {
            bc.insert(Block::new_pending(seq));
        }
        assert_eq!(bc.height(), 4);
        assert_eq!(bc.highest_below(3).map(|b| b.sequence_number), Some(2));
        assert_eq!(bc.highest_below(10).map(|b| b.sequence_number), Some(4));

        assert_eq!(bc.truncate_above(1), 3);
        assert_eq!(bc.height(), 1);
        assert!(!bc.contains(2));
        assert_eq!(bc.truncate_above(0), 1);
        assert_eq!(bc.tip(), &Block::genesis());
    }
}
