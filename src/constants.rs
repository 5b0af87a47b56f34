use std::time::Duration;

// leading zero bits a block hash must carry
pub const DIFFICULTY_BITS: u32 = 28;
// inbound blocks waiting for the consensus loop
pub const MAX_QUEUE: usize = 64;
// transactions collected before a block is sealed and mined
pub const BLOCK_TRANSACTIONS: usize = 5;
// nonces tried between two looks at the interrupt channel
pub const POLL_INTERVAL: u64 = 5000;

pub const RPC_TIMEOUT: Duration = Duration::from_secs(2);
pub const QUEUE_WAIT: Duration = Duration::from_millis(200);
// how often a partly filled block is handed to an idle miner
pub const SEAL_IDLE: Duration = Duration::from_secs(1);
pub const LIVENESS_TICK: Duration = Duration::from_millis(100);
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub const PROTOCOL_NAME: &str = "/keyledger/rpc/1.0.0";
pub const IDENTIFY_PROTOCOL: &str = "/keyledger/id/1.0.0";
pub const DEFAULT_LISTEN: &str = "/ip4/0.0.0.0/tcp/8000";
