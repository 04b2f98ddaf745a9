use chrono::Utc;
use dashmap::DashSet;
use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::account::{Account, AccountError, AccountState};
use super::block::{Block, GENESIS_PREVIOUS_HASH, GENESIS_PROOF};
use super::consensus::{
    normalize_peer_address, select_longest_valid, Candidate, PeerClient, PeerError, Resolution,
};
use super::crypto::{Address, DigitalSignature, NodeIdentity};
use super::proof_of_work::proof_of_work_with_abort;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{Sender, Transaction, TransactionError};
use super::validation::{check_chain, replay_chain, valid_chain};

/// Coins minted to the node for every forged block, genesis included
pub const MINING_REWARD: u64 = 1;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction rejected: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Peer error: {0}")]
    PeerError(#[from] PeerError),

    #[error("Mining interrupted: the chain tip changed while solving")]
    MiningInterrupted,

    #[error("The chain has no blocks")]
    EmptyChain,

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

/// Self-assessment of the node, served by the health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct NodeHealth {
    /// Set when the local chain or ledger could not be fully trusted on load
    pub needs_resync: bool,

    pub chain_length: usize,

    pub pending_transactions: usize,

    /// Human-readable reasons behind `needs_resync`
    pub problems: Vec<String>,
}

/// Every transaction an address took part in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct AddressHistory {
    /// Transactions already packaged in blocks, oldest first
    pub historical: Vec<Transaction>,

    /// Admitted transactions waiting for the next block
    pub pending: Vec<Transaction>,
}

/// A proof found for the tip identified by `last_hash`
#[derive(Debug, Clone)]
struct Solution {
    proof: u64,
    last_hash: String,
}

/// Everything guarded by the single ledger lock.
///
/// Chain, pending pool and balances always change together, so a reader
/// never sees a ledger that disagrees with the chain it was built from.
#[derive(Debug, Default)]
struct LedgerState {
    chain: Vec<Block>,
    pending: Vec<Transaction>,
    accounts: AccountState,
    problems: Vec<String>,
}

impl LedgerState {
    fn last_block(&self) -> Option<&Block> {
        self.chain.last()
    }

    /// Executes a transaction against the ledger and queues it.
    ///
    /// Returns the index of the block that will hold it.
    fn admit(&mut self, mut transaction: Transaction) -> Result<u64, TransactionError> {
        self.accounts.execute(&mut transaction)?;
        self.pending.push(transaction);
        Ok(self.chain.len() as u64)
    }
}

/// Represents the blockchain held by this node
#[derive(Debug, Clone)]
pub struct Blockchain {
    /// Chain, pending pool and balances
    state: Arc<RwLock<LedgerState>>,

    /// Known peers as `host:port`
    peers: Arc<DashSet<String>>,

    /// Bumped whenever the chain tip changes; polled by the proof search
    tip_epoch: Arc<AtomicU64>,

    /// Identity credited with mining rewards
    identity: NodeIdentity,

    /// Storage for blockchain data
    storage: Option<Arc<BlockchainStorage>>,
}

impl Blockchain {
    fn empty(identity: NodeIdentity, storage: Option<BlockchainStorage>) -> Self {
        Blockchain {
            state: Arc::new(RwLock::new(LedgerState::default())),
            peers: Arc::new(DashSet::new()),
            tip_epoch: Arc::new(AtomicU64::new(0)),
            identity,
            storage: storage.map(Arc::new),
        }
    }

    /// Creates an in-memory blockchain with a genesis block
    ///
    /// # Arguments
    ///
    /// * `identity` - The node identity credited with the genesis reward
    pub fn new(identity: NodeIdentity) -> Result<Self, BlockchainError> {
        let blockchain = Self::empty(identity, None);
        blockchain.create_genesis_block()?;
        Ok(blockchain)
    }

    /// Opens persistent storage at `storage_path` and loads the chain from it
    pub fn with_storage<P: AsRef<Path>>(
        storage_path: P,
        identity: NodeIdentity,
    ) -> Result<Self, BlockchainError> {
        let storage = BlockchainStorage::new(storage_path)?;
        Self::from_storage(storage, identity)
    }

    /// Builds a blockchain on already opened storage.
    ///
    /// An empty store gets a fresh genesis block. Otherwise the stored chain
    /// is checked and its ledger rebuilt by replay; problems flag the node as
    /// needing a resync instead of failing startup.
    pub fn from_storage(
        storage: BlockchainStorage,
        identity: NodeIdentity,
    ) -> Result<Self, BlockchainError> {
        let blockchain = Self::empty(identity, Some(storage));
        blockchain.load_from_storage()?;
        Ok(blockchain)
    }

    fn load_from_storage(&self) -> Result<(), BlockchainError> {
        let storage = match &self.storage {
            Some(storage) => storage,
            None => return Ok(()),
        };

        for peer in storage.get_all_peers()? {
            self.peers.insert(peer);
        }

        let mut chain = storage.get_all_blocks()?;
        if chain.is_empty() {
            info!("No existing blockchain found in storage, creating genesis block");
            self.create_genesis_block()?;
            return Ok(());
        }

        let mut problems = Vec::new();

        if let Err(err) = check_chain(&chain) {
            error!("Stored chain failed validation: {}", err);
            problems.push(format!("stored chain is invalid: {}", err));
        }

        let replay = replay_chain(&mut chain);
        for failure in &replay.failures {
            problems.push(format!(
                "transaction {} of block {} was skipped during replay: {}",
                failure.position, failure.block_index, failure.reason
            ));
        }

        if problems.is_empty() {
            info!("Loaded {} blocks from storage", chain.len());
        } else {
            warn!(
                "Loaded {} blocks from storage with {} problems; node needs a resync",
                chain.len(),
                problems.len()
            );
        }

        let mut state = self.state.write();
        state.chain = chain;
        state.accounts = replay.accounts;
        state.problems = problems;

        Ok(())
    }

    /// Creates the genesis block (first block in the chain)
    fn create_genesis_block(&self) -> Result<Block, BlockchainError> {
        let mut state = self.state.write();
        let genesis = self.mint_and_forge(
            &mut state,
            GENESIS_PROOF,
            Some(GENESIS_PREVIOUS_HASH.to_string()),
        )?;

        info!("Created genesis block crediting {}", self.identity.address());
        Ok(genesis)
    }

    /// Admits a transaction into the pending pool
    ///
    /// The balance effect is applied immediately, so later transactions from
    /// the same sender are checked against the updated balance.
    ///
    /// # Arguments
    ///
    /// * `sender` - Sender address, or "0" for a coinbase
    /// * `recipient` - Recipient address
    /// * `amount` - Amount to transfer
    /// * `signature` - Signature over the canonical signing message
    /// * `message` - Optional note covered by the signature
    ///
    /// # Returns
    ///
    /// The index of the block that will include this transaction
    pub fn admit_transaction(
        &self,
        sender: &str,
        recipient: &str,
        amount: u64,
        signature: Option<DigitalSignature>,
        message: Option<String>,
    ) -> Result<u64, BlockchainError> {
        let recipient: Address = recipient
            .parse()
            .map_err(|_| TransactionError::InvalidRecipientAddress(recipient.to_string()))?;

        let transaction = Transaction {
            sender: Sender::parse(sender),
            recipient,
            amount,
            message,
            signature,
            executed: false,
        };

        let mut state = self.state.write();
        match state.admit(transaction) {
            Ok(index) => {
                info!("Admitted transfer of {} from {} for block {}", amount, sender, index);
                Ok(index)
            }
            Err(err) => {
                info!("Rejected transfer of {} from {}: {}", amount, sender, err);
                Err(err.into())
            }
        }
    }

    /// Mines a new block with the pending transactions
    ///
    /// The proof search runs without holding the ledger lock. If another
    /// block lands or the chain is replaced meanwhile, the search is
    /// abandoned and nothing changes.
    ///
    /// # Returns
    ///
    /// Result with the newly forged block
    pub fn mine(&self) -> Result<Block, BlockchainError> {
        if !self.state.read().problems.is_empty() {
            warn!("Mining on a chain that needs a resync; peers will reject it until resolved");
        }

        let solution = self.solve()?;
        self.commit(solution)
    }

    fn solve(&self) -> Result<Solution, BlockchainError> {
        let (epoch, last_proof, last_hash) = {
            let state = self.state.read();
            let last = state.last_block().ok_or(BlockchainError::EmptyChain)?;
            (self.tip_epoch.load(Ordering::SeqCst), last.proof, last.hash())
        };

        debug!("Searching proof over last proof {}", last_proof);
        let proof = proof_of_work_with_abort(last_proof, || {
            self.tip_epoch.load(Ordering::SeqCst) != epoch
        })
        .ok_or(BlockchainError::MiningInterrupted)?;

        Ok(Solution { proof, last_hash })
    }

    fn commit(&self, solution: Solution) -> Result<Block, BlockchainError> {
        let mut state = self.state.write();

        let tip_unchanged = state
            .last_block()
            .map_or(false, |last| last.hash() == solution.last_hash);
        if !tip_unchanged {
            info!("Chain tip moved while mining; discarding proof {}", solution.proof);
            return Err(BlockchainError::MiningInterrupted);
        }

        let block = self.mint_and_forge(&mut state, solution.proof, Some(solution.last_hash))?;
        info!(
            "Forged block {} with {} transactions",
            block.index,
            block.transactions.len()
        );

        Ok(block)
    }

    /// Admits the mining reward and forges it into a block along with the
    /// pending pool. A failed forge leaves no trace of the reward.
    fn mint_and_forge(
        &self,
        state: &mut LedgerState,
        proof: u64,
        previous_hash: Option<String>,
    ) -> Result<Block, BlockchainError> {
        let reward = Transaction::new_coinbase(self.identity.address().clone(), MINING_REWARD);
        let effect = reward.effect();
        state.admit(reward)?;

        match self.forge(state, proof, previous_hash) {
            Ok(block) => Ok(block),
            Err(err) => {
                // The pool is back in place with the reward last
                state.pending.pop();
                if let Err(revert_err) = state.accounts.revert(&effect) {
                    error!("Failed to revert mining reward: {}", revert_err);
                }
                Err(err)
            }
        }
    }

    /// Packages the whole pending pool into a new block and appends it.
    ///
    /// The block is persisted before it becomes visible; on a storage
    /// failure the pool is restored and the chain is unchanged.
    fn forge(
        &self,
        state: &mut LedgerState,
        proof: u64,
        previous_hash: Option<String>,
    ) -> Result<Block, BlockchainError> {
        let previous_hash = match previous_hash {
            Some(hash) => hash,
            None => state
                .last_block()
                .map(Block::hash)
                .ok_or(BlockchainError::EmptyChain)?,
        };

        // Wall clocks can step back; timestamps must not
        let now = Utc::now();
        let timestamp = match state.last_block() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };

        let block = Block::new(
            state.chain.len() as u64,
            timestamp,
            std::mem::take(&mut state.pending),
            proof,
            previous_hash,
        );

        if let Some(storage) = &self.storage {
            if let Err(err) = storage.save_block(&block) {
                error!("Failed to persist block {}: {}", block.index, err);
                state.pending = block.transactions;
                return Err(err.into());
            }
        }

        state.chain.push(block.clone());
        self.tip_epoch.fetch_add(1, Ordering::SeqCst);

        Ok(block)
    }

    /// Returns a snapshot of the chain together with its length
    pub fn get_chain(&self) -> (Vec<Block>, usize) {
        let state = self.state.read();
        (state.chain.clone(), state.chain.len())
    }

    /// Same snapshot as [`Blockchain::get_chain`], plus whether that exact
    /// chain is structurally valid
    pub fn get_chain_with_validity(&self) -> (Vec<Block>, usize, bool) {
        let state = self.state.read();
        (state.chain.clone(), state.chain.len(), valid_chain(&state.chain))
    }

    pub fn get_pending_transactions(&self) -> Vec<Transaction> {
        self.state.read().pending.clone()
    }

    /// Adds a peer, returning its normalized `host:port` form.
    ///
    /// Re-registering a known peer is a no-op.
    pub fn register_peer(&self, address: &str) -> Result<String, BlockchainError> {
        let peer = normalize_peer_address(address)?;

        if self.peers.contains(&peer) {
            debug!("Peer {} already registered", peer);
            return Ok(peer);
        }

        if let Some(storage) = &self.storage {
            storage.save_peer(&peer)?;
        }
        self.peers.insert(peer.clone());

        info!("Registered peer {}", peer);
        Ok(peer)
    }

    /// Known peers, sorted
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.iter().map(|peer| peer.key().clone()).collect();
        peers.sort();
        peers
    }

    /// Asks every peer for its chain and adopts the longest valid one that
    /// beats the local chain
    pub async fn resolve_conflicts(
        &self,
        client: &dyn PeerClient,
    ) -> Result<Resolution, BlockchainError> {
        let peers = self.peers();
        if peers.is_empty() {
            info!("No peers registered; keeping the local chain");
            return Ok(Resolution::default());
        }

        let local_length = self.state.read().chain.len();
        info!("Resolving conflicts with {} peers at length {}", peers.len(), local_length);

        let responses = join_all(peers.into_iter().map(|peer| async move {
            let response = client.fetch_chain(&peer).await;
            (peer, response)
        }))
        .await;

        // Replaying peer chains is CPU bound
        let selection =
            tokio::task::spawn_blocking(move || select_longest_valid(local_length, responses))
                .await
                .map_err(|e| BlockchainError::TaskFailed(e.to_string()))?;
        let mut resolution = Resolution {
            replaced: false,
            rejected_peers: selection.rejected,
        };

        if let Some(candidate) = selection.candidate {
            resolution.replaced = self.adopt(candidate)?;
        } else {
            info!("Local chain is authoritative");
        }

        Ok(resolution)
    }

    /// Runs a resolution round and returns it with the chain now held
    pub async fn resolve_consensus(
        &self,
        client: &dyn PeerClient,
    ) -> Result<(Resolution, Vec<Block>), BlockchainError> {
        let resolution = self.resolve_conflicts(client).await?;
        let (chain, _) = self.get_chain();
        Ok((resolution, chain))
    }

    /// Swaps in a validated peer chain and its rebuilt ledger.
    ///
    /// Pending transactions are re-executed against the new ledger; those it
    /// can no longer accept are dropped.
    fn adopt(&self, candidate: Candidate) -> Result<bool, BlockchainError> {
        let mut state = self.state.write();

        // Blocks may have landed locally while peers were being queried
        if candidate.chain.len() <= state.chain.len() {
            info!(
                "Local chain grew to {} blocks while resolving; keeping it",
                state.chain.len()
            );
            return Ok(false);
        }

        if let Some(storage) = &self.storage {
            if let Err(err) = storage.replace_chain(&candidate.chain) {
                error!("Failed to persist chain from {}: {}", candidate.peer, err);
                return Err(err.into());
            }
        }

        let Candidate {
            peer,
            chain,
            mut accounts,
        } = candidate;

        let mut pending = Vec::with_capacity(state.pending.len());
        for mut transaction in std::mem::take(&mut state.pending) {
            transaction.executed = false;
            match accounts.execute(&mut transaction) {
                Ok(()) => pending.push(transaction),
                Err(err) => warn!(
                    "Evicting pending transfer from {} to {}: {}",
                    transaction.sender, transaction.recipient, err
                ),
            }
        }

        info!("Replaced local chain with {} blocks from {}", chain.len(), peer);

        state.chain = chain;
        state.accounts = accounts;
        state.pending = pending;
        state.problems.clear();
        self.tip_epoch.fetch_add(1, Ordering::SeqCst);

        Ok(true)
    }

    /// Returns the transactions an address sent or received, or `None` if the
    /// address is unknown to the ledger
    pub fn get_transactions_for(&self, address: &str) -> Option<AddressHistory> {
        let address = Address(address.to_string());
        let state = self.state.read();

        if !state.accounts.contains(&address) {
            return None;
        }

        // Transactions skipped during replay never moved a balance
        let historical = state
            .chain
            .iter()
            .flat_map(|block| block.transactions.iter())
            .filter(|transaction| transaction.executed && transaction.involves(&address))
            .cloned()
            .collect();
        let pending = state
            .pending
            .iter()
            .filter(|transaction| transaction.involves(&address))
            .cloned()
            .collect();

        Some(AddressHistory { historical, pending })
    }

    /// Returns the balance and transaction count of an address, read under a
    /// single lock, or `None` if it is unknown
    pub fn get_account(&self, address: &str) -> Option<Account> {
        self.state
            .read()
            .accounts
            .get_account(&Address(address.to_string()))
            .cloned()
    }

    /// Returns how many transactions an address sent or received so far,
    /// which is the count its next signature must commit to
    pub fn transaction_count(&self, address: &str) -> Option<u64> {
        self.state
            .read()
            .accounts
            .get_account(&Address(address.to_string()))
            .map(|account| account.transaction_count)
    }

    /// Gets all accounts, sorted by address
    pub fn get_all_accounts(&self) -> Vec<Account> {
        self.state.read().accounts.get_all_accounts()
    }

    /// Checks if the local chain is structurally valid
    pub fn is_valid(&self) -> bool {
        valid_chain(&self.state.read().chain)
    }

    pub fn health(&self) -> NodeHealth {
        let state = self.state.read();
        NodeHealth {
            needs_resync: !state.problems.is_empty(),
            chain_length: state.chain.len(),
            pending_transactions: state.pending.len(),
            problems: state.problems.clone(),
        }
    }
}
