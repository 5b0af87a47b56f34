use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::UnboundedSender;

use crate::block::{canonical_payload, meets_target, Block, Hash};
use crate::constants::{LIVENESS_TICK, POLL_INTERVAL};

/// The node's side of the miner: sealed blocks go in through `submit`, new
/// chain tips through `interrupt`.
#[derive(Debug, Clone)]
pub struct MinerHandle {
    jobs: Sender<Block>,
    interrupt: Sender<Block>,
    working: Arc<AtomicBool>,
}

impl MinerHandle {
    pub fn submit(&self, block: Block) -> bool {
        self.jobs.send(block).is_ok()
    }

    pub fn interrupt(&self, tip: Block) -> bool {
        self.interrupt.send(tip).is_ok()
    }

    /// True while the miner is searching nonces for a job.
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }
}

/// Proof-of-work engine. Runs on its own thread and owns the receiving ends
/// of both channels.
pub struct Miner {
    difficulty: u32,
    poll_interval: u64,
    jobs: Receiver<Block>,
    interrupt: Receiver<Block>,
    alive: Arc<AtomicBool>,
    working: Arc<AtomicBool>,
    tip: Block,
    restarts: u64,
}

impl Miner {
    pub fn new(difficulty: u32, alive: Arc<AtomicBool>) -> (Miner, MinerHandle) {
        let (jobs_tx, jobs) = mpsc::channel();
        let (interrupt_tx, interrupt) = mpsc::channel();
        let working = Arc::new(AtomicBool::new(false));
        let miner = Miner {
            difficulty,
            poll_interval: POLL_INTERVAL,
            jobs,
            interrupt,
            alive,
            working: working.clone(),
            tip: Block::genesis(),
            restarts: 0,
        };
        let handle = MinerHandle {
            jobs: jobs_tx,
            interrupt: interrupt_tx,
            working,
        };
        (miner, handle)
    }

    pub fn with_poll_interval(mut self, poll_interval: u64) -> Miner {
        self.poll_interval = poll_interval.max(1);
        self
    }

    /// The block the next job will be mined on.
    pub fn tip(&self) -> &Block {
        &self.tip
    }

    /// How many times mining was restarted by an interrupt.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub(crate) fn latest_interrupt(&mut self) -> Option<Block> {
        let mut latest = None;
        while let Ok(b) = self.interrupt.try_recv() {
            latest = Some(b);
        }
        latest
    }

    /// Searches nonces from 0 upward until the block hash meets the target.
    /// Every `poll_interval` attempts the interrupt channel is checked; a new
    /// tip moves the block on top of it and the search starts over. Returns
    /// `None` only when the node is shutting down.
    pub fn mine(&mut self, mut block: Block, mut parent_hash: Hash) -> Option<Block> {
        loop {
            let payload = match canonical_payload(&parent_hash, &block.transactions) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("cannot mine block {}: {}", block.sequence_number, e);
                    return None;
                }
            };
            let prefix = Sha256::new_with_prefix(&payload);
            let mut nonce: u64 = 0;
            let competitor = loop {
                if nonce % self.poll_interval == 0 {
                    if !self.alive.load(Ordering::SeqCst) {
                        return None;
                    }
                    if let Some(tip) = self.latest_interrupt() {
                        let same_parent = tip.hash == parent_hash
                            && tip.sequence_number + 1 == block.sequence_number;
                        if !same_parent {
                            break tip;
                        }
                    }
                }
                let mut hasher = prefix.clone();
                hasher.update(nonce.to_be_bytes());
                let digest: Hash = hasher.finalize().into();
                if meets_target(&digest, self.difficulty) {
                    block.proof_of_work = nonce;
                    block.hash = digest;
                    block.parent_hash = parent_hash;
                    // the next job goes on top of this one, never beside it
                    self.tip = block.clone();
                    return Some(block);
                }
                nonce = match nonce.checked_add(1) {
                    Some(n) => n,
                    None => {
                        warn!("nonce space exhausted for block {}", block.sequence_number);
                        return None;
                    }
                };
            };
            info!(
                "mining of block {} interrupted by block {} {}, restarting",
                block.sequence_number,
                competitor.sequence_number,
                competitor.get_hash()
            );
            self.restarts += 1;
            block.sequence_number = competitor.sequence_number + 1;
            parent_hash = competitor.hash;
            self.tip = competitor;
        }
    }

    /// Mines sealed blocks one after another until shutdown, handing each
    /// result to `mined`.
    pub fn run(mut self, mined: UnboundedSender<Block>) {
        info!("miner started, difficulty {} bits", self.difficulty);
        while self.alive.load(Ordering::SeqCst) {
            let mut block = match self.jobs.recv_timeout(LIVENESS_TICK) {
                Ok(block) => block,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if let Some(tip) = self.latest_interrupt() {
                self.tip = tip;
            }
            block.sequence_number = self.tip.sequence_number + 1;
            let parent_hash = self.tip.hash;
            info!(
                "mining block {} with {} transactions",
                block.sequence_number,
                block.transactions.len()
            );
            self.working.store(true, Ordering::SeqCst);
            let mined_block = self.mine(block, parent_hash);
            self.working.store(false, Ordering::SeqCst);
            match mined_block {
                Some(b) => {
                    info!(
                        "mined block {} nonce {} hash {}",
                        b.sequence_number,
                        b.proof_of_work,
                        b.get_hash()
                    );
                    if mined.send(b).is_err() {
                        debug!("node stopped listening for mined blocks");
                        break;
                    }
                }
                None => break,
            }
        }
        info!("miner stopped");
    }

    pub fn spawn(self, mined: UnboundedSender<Block>) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run(mined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{empty_chain, Fixture, TEST_DIFFICULTY};
    use crate::wallet::Wallet;

    fn alive() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    fn pending_block(fx: &Fixture) -> Block {
        let mut block = Block::new_pending(1);
        block.transactions = vec![fx.register("alice@x.com", &Wallet::new())];
        block
    }

    #[test]
    fn test_mining_is_deterministic() {
        let fx = Fixture::new();
        let block = pending_block(&fx);
        let genesis = Block::genesis();

        let (mut m1, _h1) = Miner::new(TEST_DIFFICULTY, alive());
        let (mut m2, _h2) = Miner::new(TEST_DIFFICULTY, alive());
        let a = m1.mine(block.clone(), genesis.hash).unwrap();
        let b = m2.mine(block, genesis.hash).unwrap();
        assert_eq!(a.proof_of_work, b.proof_of_work);
        assert_eq!(a.hash, b.hash);
        assert!(a.sanity_check(TEST_DIFFICULTY));
        assert_eq!(a.parent_hash, genesis.hash);
        assert_eq!(m1.restarts(), 0);
    }

    #[test]
    fn test_interrupt_restarts_on_competing_block() {
        let fx = Fixture::new();
        let chain = empty_chain(2);
        let competitor = chain[2].clone();

        let (mut miner, handle) = Miner::new(TEST_DIFFICULTY, alive());
        assert!(handle.interrupt(chain[1].clone()));
        assert!(handle.interrupt(competitor.clone()));
        let mined = miner.mine(pending_block(&fx), Block::genesis().hash).unwrap();

        assert_eq!(miner.restarts(), 1);
        assert_eq!(mined.sequence_number, competitor.sequence_number + 1);
        assert_eq!(mined.parent_hash, competitor.hash);
        assert!(mined.sanity_check(TEST_DIFFICULTY));
        assert_eq!(miner.tip(), &mined);
    }

    #[test]
    fn test_interrupt_with_current_parent_is_ignored() {
        let fx = Fixture::new();
        let (mut miner, handle) = Miner::new(TEST_DIFFICULTY, alive());
        handle.interrupt(Block::genesis());
        let mined = miner.mine(pending_block(&fx), Block::genesis().hash).unwrap();
        assert_eq!(miner.restarts(), 0);
        assert_eq!(mined.sequence_number, 1);
    }

    #[test]
    fn test_shutdown_stops_mining() {
        let fx = Fixture::new();
        let flag = alive();
        let (miner, _handle) = Miner::new(60, flag.clone());
        let mut miner = miner.with_poll_interval(100);
        flag.store(false, Ordering::SeqCst);
        assert!(miner.mine(pending_block(&fx), Block::genesis().hash).is_none());
    }

    #[test]
    fn test_run_mines_jobs_on_latest_tip() {
        let fx = Fixture::new();
        let flag = alive();
        let chain = empty_chain(3);
        let (miner, handle) = Miner::new(TEST_DIFFICULTY, flag.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let worker = miner.spawn(tx);

        handle.interrupt(chain[3].clone());
        handle.submit(pending_block(&fx));
        let first = rx.blocking_recv().unwrap();
        assert_eq!(first.sequence_number, 4);
        assert_eq!(first.parent_hash, chain[3].hash);

        // without a new tip the next job lands on top of the first
        handle.submit(Block::new_pending(0));
        let second = rx.blocking_recv().unwrap();
        assert_eq!(second.sequence_number, 5);
        assert_eq!(second.parent_hash, first.hash);

        flag.store(false, Ordering::SeqCst);
        worker.join().unwrap();
        assert!(!handle.is_working());
    }
}
