use std::time::Duration;

use libp2p::Multiaddr;

use crate::constants::*;
use crate::validator::Validator;
use crate::wallet::PublicKey;

/// Everything a node needs to know at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen: Multiaddr,
    pub peers: Vec<Multiaddr>,
    pub difficulty: u32,
    pub queue_capacity: usize,
    pub block_transactions: usize,
    pub rpc_timeout: Duration,
    pub poll_interval: u64,
    pub authority_key: PublicKey,
}

impl NodeConfig {
    pub fn new(authority_key: PublicKey) -> NodeConfig {
        NodeConfig {
            listen: Multiaddr::empty(),
            peers: Vec::new(),
            difficulty: DIFFICULTY_BITS,
            queue_capacity: MAX_QUEUE,
            block_transactions: BLOCK_TRANSACTIONS,
            rpc_timeout: RPC_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            authority_key,
        }
    }

    pub fn validator(&self) -> Validator {
        Validator::new(self.difficulty, self.authority_key.clone())
    }
}
