use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::authority::CertificateAuthority;
use crate::block::{Block, Hash};
use crate::blockchain::Blockchain;
use crate::blockqueue::BlockQueue;
use crate::config::NodeConfig;
use crate::constants::{QUEUE_WAIT, SEAL_IDLE};
use crate::errors::{ConsensusError, QueueFull, SubmitError};
use crate::message::{Request, Response};
use crate::pow::{Miner, MinerHandle};
use crate::rpc::{serve, InboundRequest, PeerClient, RequestHandler, RpcClient};
use crate::transaction::{Transaction, TxKind};
use crate::validator::Validator;
use crate::wallet::PublicKey;

/// A full node: the chain, the inbound block queue, the block being filled
/// with submitted transactions, and the link to the miner.
///
/// Lock order is chain, then pending, then queue or sealed. The chain lock
/// is async and is held while peers are polled; the others are never held
/// across an await.
pub struct Server<C: PeerClient> {
    config: NodeConfig,
    validator: Validator,
    client: C,
    miner: MinerHandle,
    chain: AsyncMutex<Blockchain>,
    queue: Mutex<BlockQueue>,
    queue_ready: Notify,
    pending: Mutex<Block>,
    // batches handed to the miner whose block has not been processed yet
    sealed: Mutex<Vec<Vec<Transaction>>>,
    alive: Arc<AtomicBool>,
}

/// Background work started by `Server::start`.
pub struct NodeTasks {
    miner: thread::JoinHandle<()>,
    announcer: JoinHandle<()>,
    consensus: JoinHandle<()>,
    sealer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl NodeTasks {
    pub async fn join(self) {
        if let Err(e) = self.consensus.await {
            error!("consensus task failed: {}", e);
        }
        if let Err(e) = self.sealer.await {
            error!("sealer task failed: {}", e);
        }
        if let Err(e) = self.announcer.await {
            error!("announcer task failed: {}", e);
        }
        let miner = self.miner;
        match tokio::task::spawn_blocking(move || miner.join()).await {
            Ok(Ok(())) => {}
            _ => error!("miner thread panicked"),
        }
        // ends once the network task drops its inbound sender
        if let Err(e) = self.dispatcher.await {
            error!("request dispatcher failed: {}", e);
        }
    }
}

/// Picks the block reported by strictly more peers than any other. No
/// responses or a tie for first place means there is no majority.
pub fn tally_majority(responses: Vec<Block>) -> Option<Block> {
    let mut votes: HashMap<Hash, (usize, Block)> = HashMap::new();
    for block in responses {
        match votes.get_mut(&block.hash) {
            Some(entry) => entry.0 += 1,
            None => {
                votes.insert(block.hash, (1, block));
            }
        }
    }
    let best = votes.values().map(|(n, _)| *n).max()?;
    let mut leaders = votes.into_values().filter(|(n, _)| *n == best);
    let (_, block) = leaders.next()?;
    if leaders.next().is_some() {
        return None;
    }
    Some(block)
}

impl<C: PeerClient> Server<C> {
    pub fn new(
        config: NodeConfig,
        client: C,
        miner: MinerHandle,
        alive: Arc<AtomicBool>,
    ) -> Server<C> {
        Server {
            validator: config.validator(),
            queue: Mutex::new(BlockQueue::new(config.queue_capacity)),
            config,
            client,
            miner,
            chain: AsyncMutex::new(Blockchain::new()),
            queue_ready: Notify::new(),
            pending: Mutex::new(Block::new_pending(0)),
            sealed: Mutex::new(Vec::new()),
            alive,
        }
    }

    fn queue(&self) -> MutexGuard<'_, BlockQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Block> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sealed(&self) -> MutexGuard<'_, Vec<Vec<Transaction>>> {
        self.sealed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.queue_ready.notify_waiters();
    }

    /// Adds a block to the inbound queue and wakes the consensus loop.
    pub fn enqueue(&self, block: Block) -> Result<(), QueueFull> {
        self.queue().push(block)?;
        self.queue_ready.notify_one();
        Ok(())
    }

    pub async fn tip(&self) -> Block {
        self.chain.lock().await.tip().clone()
    }

    pub async fn get_block(&self, seq: u64) -> Option<Block> {
        self.chain.lock().await.get(seq).cloned()
    }

    pub async fn get_public_key(&self, email: &str) -> Option<PublicKey> {
        self.chain.lock().await.database().get(email).cloned()
    }

    /*************************** consensus ***************************/

    /// Takes one block off the queue and processes it under the chain lock.
    /// Returns false when the queue was empty.
    pub async fn process_next(&self) -> bool {
        let mut chain = self.chain.lock().await;
        let next = self.queue().pop();
        match next {
            Some(block) => {
                self.process_block(&mut chain, block).await;
                true
            }
            None => false,
        }
    }

    /// Runs one block through consensus. Afterwards the miner is pointed at
    /// the chain tip unless the block simply extended it, so a job built on
    /// a block that did not make it into the chain is mined again on the
    /// real tip.
    pub async fn process_block(&self, chain: &mut Blockchain, block: Block) {
        let seq = block.sequence_number;
        if seq == 0 {
            debug!("ignoring block claiming the genesis height");
            return;
        }
        if !block.sanity_check(self.validator.difficulty()) {
            warn!("discarding corrupt block {} {}", seq, block.get_hash());
            return;
        }
        let old_tip = chain.tip().hash;
        let hash = block.hash;
        let batch = block.transactions.clone();
        let local = chain.get(seq).map(|b| b.hash);
        match local {
            None => match self.process_unseen_block(chain, block).await {
                Ok(true) => info!("accepted block {}", seq),
                Ok(false) => info!("block {} rejected", seq),
                Err(e) => warn!("could not catch up to block {}: {}", seq, e),
            },
            Some(local) if local == hash => debug!("already have block {}", seq),
            Some(_) => match self.peer_check_and_fix_block(chain, block).await {
                Ok(0) => info!("kept local block {}", seq),
                Ok(height) => info!("switched to the peer majority fork, tip now {}", height),
                Err(e) => warn!("fork at block {} left unresolved: {}", seq, e),
            },
        }
        self.settle_sealed(&batch);
        let tip = chain.tip();
        if tip.hash != old_tip || tip.hash != hash {
            debug!("pointing miner at tip {} {}", tip.sequence_number, tip.get_hash());
            if !self.miner.interrupt(tip.clone()) {
                warn!("miner is not running");
            }
        }
    }

    /// Handles a block above everything stored at its height. Local blocks
    /// the peer majority disagrees with are dropped, missing heights are
    /// fetched from peers, then the block itself is validated. Work is done
    /// on a copy of the chain; a failed backfill leaves `chain` untouched.
    /// The backfilled chain is kept even when the block itself is rejected.
    pub async fn process_unseen_block(
        &self,
        chain: &mut Blockchain,
        block: Block,
    ) -> Result<bool, ConsensusError> {
        let seq = block.sequence_number;
        let mut staged = chain.clone();
        let mut agreed = staged.highest_below(seq).map(|b| b.sequence_number).unwrap_or(0);
        while agreed > 0 {
            let local = match staged.get(agreed) {
                Some(b) => b.clone(),
                None => break,
            };
            if self.peer_check_block(agreed, &local).await {
                break;
            }
            info!("peers disagree with local block {}, stepping back", agreed);
            agreed -= 1;
        }
        if staged.truncate_above(agreed) > 0 {
            self.validator
                .rebuild_database(&mut staged)
                .map_err(|e| ConsensusError::InvalidBlock { seq: e.seq, cause: e.cause })?;
        }
        self.backfill(&mut staged, agreed + 1, seq).await?;
        let accepted = match self.validator.accept_block(block, &mut staged) {
            Ok(()) => true,
            Err(e) => {
                warn!("block {} failed validation: {}", seq, e);
                false
            }
        };
        *chain = staged;
        Ok(accepted)
    }

    async fn backfill(
        &self,
        staged: &mut Blockchain,
        from: u64,
        until: u64,
    ) -> Result<(), ConsensusError> {
        for seq in from..until {
            let block = self
                .peer_request_block(seq)
                .await
                .ok_or(ConsensusError::ChainGap { seq })?;
            self.validator
                .accept_block(block, staged)
                .map_err(|cause| ConsensusError::InvalidBlock { seq, cause })?;
            debug!("backfilled block {}", seq);
        }
        Ok(())
    }

    /// Handles a block that competes with the one stored at its height.
    /// Walks down until the local block matches the peer majority, then
    /// rebuilds forward from majority blocks through the contested height
    /// and beyond as long as peers keep agreeing. Returns the new tip
    /// height, or 0 if the local block already was the majority choice.
    pub async fn peer_check_and_fix_block(
        &self,
        chain: &mut Blockchain,
        block: Block,
    ) -> Result<u64, ConsensusError> {
        let seq = block.sequence_number;
        let mut fork_point = seq;
        while fork_point > 0 {
            let local = match chain.get(fork_point) {
                Some(b) => b.clone(),
                None => break,
            };
            if self.peer_check_block(fork_point, &local).await {
                break;
            }
            fork_point -= 1;
        }
        if fork_point == seq {
            return Ok(0);
        }
        info!("local chain forked from the peer majority after block {}", fork_point);

        let mut staged = chain.clone();
        staged.truncate_above(fork_point);
        self.validator
            .rebuild_database(&mut staged)
            .map_err(|e| ConsensusError::InvalidBlock { seq: e.seq, cause: e.cause })?;
        self.backfill(&mut staged, fork_point + 1, seq + 1).await?;
        let mut next = seq + 1;
        while let Some(extra) = self.peer_request_block(next).await {
            if let Err(e) = self.validator.accept_block(extra, &mut staged) {
                warn!("stopping fork repair at block {}: {}", next, e);
                break;
            }
            next += 1;
        }
        let height = staged.height();
        *chain = staged;
        Ok(height)
    }

    /// True if `local` is what the peer majority holds at `seq`, or if peers
    /// have no majority to offer. Genesis always agrees.
    pub async fn peer_check_block(&self, seq: u64, local: &Block) -> bool {
        if seq == 0 {
            return true;
        }
        match self.peer_request_block(seq).await {
            Some(majority) if majority.hash == local.hash => true,
            Some(majority) => {
                debug!(
                    "peer majority at {} is {}, local is {}",
                    seq,
                    majority.get_hash(),
                    local.get_hash()
                );
                false
            }
            None => {
                debug!("no peer majority at {}, keeping local block", seq);
                true
            }
        }
    }

    /// Asks every peer for block `seq` concurrently and returns the majority
    /// answer. Silent peers, wrong heights and blocks failing the sanity
    /// check cast no vote.
    pub async fn peer_request_block(&self, seq: u64) -> Option<Block> {
        let difficulty = self.validator.difficulty();
        let timeout = self.config.rpc_timeout;
        let calls = self.config.peers.iter().map(|peer| async move {
            match tokio::time::timeout(timeout, self.client.request_block(peer, seq)).await {
                Ok(Some(b)) if b.sequence_number == seq && b.sanity_check(difficulty) => Some(b),
                Ok(Some(b)) => {
                    warn!("{} answered block {} with a bad block {}", peer, seq, b.get_hash());
                    None
                }
                Ok(None) => None,
                Err(_) => {
                    debug!("{} timed out on block {}", peer, seq);
                    None
                }
            }
        });
        let responses: Vec<Block> = join_all(calls).await.into_iter().flatten().collect();
        tally_majority(responses)
    }

    /// Loops over the block queue until shutdown.
    pub async fn run_consensus(&self) {
        info!("consensus loop started");
        while self.is_alive() {
            if !self.process_next().await {
                let _ = tokio::time::timeout(QUEUE_WAIT, self.queue_ready.notified()).await;
            }
        }
        info!("consensus loop stopped");
    }

    /*************************** transactions ***************************/

    /// Checks a transaction against the chain database overlaid with blocks
    /// already handed to the miner and with the pending block, then appends
    /// it. A full pending block is sealed and handed to the miner.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<(), SubmitError> {
        let chain = self.chain.lock().await;
        let mut pending = self.pending();
        let current = {
            let sealed = self.sealed();
            pending
                .transactions
                .iter()
                .rev()
                .chain(sealed.iter().rev().flat_map(|batch| batch.iter().rev()))
                .find(|t| t.email == tx.email)
                .map(|t| t.public_key.clone())
                .or_else(|| chain.database().get(&tx.email).cloned())
        };
        if let Err(e) = self.validator.validate_transaction(&tx, current.as_ref()) {
            info!("refusing transaction for {}: {}", tx.email, e);
            return Err(e.into());
        }
        info!("queued {:?} for {}", tx.kind, tx.email);
        pending.transactions.push(tx);
        if pending.transactions.len() >= self.config.block_transactions {
            let sealed = std::mem::replace(&mut *pending, Block::new_pending(0));
            self.seal(sealed);
        }
        Ok(())
    }

    pub async fn register_public_key(
        &self,
        email: &str,
        public_key: PublicKey,
        authority: &dyn CertificateAuthority,
    ) -> Result<(), SubmitError> {
        let tx = Transaction::new_register(email, public_key, authority)?;
        self.submit_transaction(tx).await
    }

    /// `signature` is made with the key currently registered for `email`.
    pub async fn update_public_key(
        &self,
        email: &str,
        public_key: PublicKey,
        signature: Vec<u8>,
    ) -> Result<(), SubmitError> {
        let tx = Transaction::from_parts(TxKind::Update, email, public_key, signature);
        self.submit_transaction(tx).await
    }

    /// Hands the pending block to the miner even if it is not full. Returns
    /// false if there was nothing to seal.
    pub fn seal_pending_block(&self) -> bool {
        let sealed = std::mem::replace(&mut *self.pending(), Block::new_pending(0));
        if sealed.transactions.is_empty() {
            return false;
        }
        self.seal(sealed);
        true
    }

    /// Seals a partly filled block, but only while the miner has no job.
    pub fn seal_if_idle(&self) -> bool {
        if self.miner.is_working() {
            return false;
        }
        self.seal_pending_block()
    }

    fn seal(&self, block: Block) {
        info!("sealing block with {} transactions", block.transactions.len());
        self.sealed().push(block.transactions.clone());
        if !self.miner.submit(block) {
            warn!("miner is not running, sealed block lost");
            self.sealed().pop();
        }
    }

    // the batch has been through consensus, accepted or not
    fn settle_sealed(&self, batch: &[Transaction]) {
        if batch.is_empty() {
            return;
        }
        let mut sealed = self.sealed();
        if let Some(i) = sealed.iter().position(|b| b.as_slice() == batch) {
            sealed.remove(i);
        }
    }

    async fn run_sealer(&self) {
        let mut tick = tokio::time::interval(SEAL_IDLE);
        while self.is_alive() {
            tick.tick().await;
            if self.seal_if_idle() {
                debug!("sealed a partial block for the idle miner");
            }
        }
        debug!("sealer stopped");
    }

    /// A freshly mined block goes through our own queue like any other, and
    /// out to every peer.
    pub async fn announce_block(&self, block: Block) {
        info!("announcing block {} {}", block.sequence_number, block.get_hash());
        if let Err(e) = self.enqueue(block.clone()) {
            warn!("own block {} dropped: {}", block.sequence_number, e);
            self.settle_sealed(&block.transactions);
        }
        let timeout = self.config.rpc_timeout;
        let block = &block;
        let sends = self.config.peers.iter().map(|peer| async move {
            tokio::time::timeout(timeout, self.client.send_block(peer, block))
                .await
                .unwrap_or(false)
        });
        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        info!(
            "block {} taken by {}/{} peers",
            block.sequence_number,
            delivered,
            self.config.peers.len()
        );
    }

    /// Starts the miner thread, the announcer that forwards mined blocks, the
    /// consensus loop, the idle sealer and the dispatcher answering inbound
    /// requests.
    pub fn start(
        self: &Arc<Self>,
        miner: Miner,
        inbound: mpsc::UnboundedReceiver<InboundRequest>,
        responder: RpcClient,
    ) -> NodeTasks {
        let (mined_tx, mut mined_rx) = mpsc::unbounded_channel();
        let miner = miner.spawn(mined_tx);

        let server = self.clone();
        let announcer = tokio::spawn(async move {
            while let Some(block) = mined_rx.recv().await {
                server.announce_block(block).await;
            }
            debug!("announcer stopped");
        });

        let server = self.clone();
        let consensus = tokio::spawn(async move { server.run_consensus().await });

        let server = self.clone();
        let sealer = tokio::spawn(async move { server.run_sealer().await });

        let dispatcher = tokio::spawn(serve(self.clone(), responder, inbound));

        NodeTasks {
            miner,
            announcer,
            consensus,
            sealer,
            dispatcher,
        }
    }
}

impl<C: PeerClient> RequestHandler for Server<C> {
    fn handle(&self, request: Request) -> impl Future<Output = Response> + Send {
        async move {
            match request {
                Request::SendBlock(msg) => match self.enqueue(msg.block) {
                    Ok(()) => Response::Accepted,
                    Err(e) => Response::Rejected(e.to_string()),
                },
                Request::RequestBlock(msg) => match self.get_block(msg.sequence_number).await {
                    Some(block) => Response::Found(block),
                    None => Response::NotFound,
                },
                Request::SubmitTransaction(msg) => {
                    match self.submit_transaction(msg.transaction).await {
                        Ok(()) => Response::Accepted,
                        Err(e) => Response::Rejected(e.to_string()),
                    }
                }
                Request::GetPublicKey(msg) => {
                    Response::PublicKey(self.get_public_key(&msg.email).await)
                }
            }
        }
    }
}
