use crate::authority::LocalAuthority;
use crate::block::{compute_hash, meets_target, Block};
use crate::transaction::Transaction;
use crate::validator::Validator;
use crate::wallet::Wallet;

pub const TEST_DIFFICULTY: u32 = 8;

pub struct Fixture {
    pub ca: LocalAuthority,
    pub validator: Validator,
}

impl Fixture {
    pub fn new() -> Fixture {
        let ca_wallet = Wallet::new();
        let validator = Validator::new(TEST_DIFFICULTY, ca_wallet.public_key.clone());
        Fixture {
            ca: LocalAuthority::new(ca_wallet),
            validator,
        }
    }

    pub fn register(&self, email: &str, owner: &Wallet) -> Transaction {
        Transaction::new_register(email, owner.public_key.clone(), &self.ca).unwrap()
    }
}

/// Brute-forces a block on top of `parent` at the test difficulty.
pub fn mine_on(parent: &Block, transactions: Vec<Transaction>) -> Block {
    let mut block = Block::new_pending(parent.sequence_number + 1);
    block.parent_hash = parent.hash;
    block.transactions = transactions;
    loop {
        let hash =
            compute_hash(&block.parent_hash, &block.transactions, block.proof_of_work).unwrap();
        if meets_target(&hash, TEST_DIFFICULTY) {
            block.hash = hash;
            return block;
        }
        block.proof_of_work += 1;
    }
}

/// A chain of `len` empty blocks above genesis.
pub fn empty_chain(len: u64) -> Vec<Block> {
    let mut blocks = vec![Block::genesis()];
    for _ in 0..len {
        let next = mine_on(blocks.last().unwrap(), vec![]);
        blocks.push(next);
    }
    blocks
}
