// Structural chain validation and ledger reconstruction.
//
// Both work on plain block slices so they apply equally to the local chain,
// to what was loaded from disk and to chains served by peers.

use log::warn;
use thiserror::Error;

use super::account::AccountState;
use super::block::Block;
use super::proof_of_work::valid_proof;

/// First structural violation found in a chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainValidationError {
    #[error("Genesis block has index {0}, expected 0")]
    GenesisIndex(u64),

    #[error("Block {index} does not follow block {previous}")]
    IndexGap { index: u64, previous: u64 },

    #[error("Block {0} does not link to the hash of its predecessor")]
    BrokenLink(u64),

    #[error("Block {0} carries an invalid proof of work")]
    InvalidProof(u64),

    #[error("Block {0} is timestamped before its predecessor")]
    TimestampRegression(u64),
}

/// A transaction that could not be executed while replaying a chain
#[derive(Debug, Clone)]
pub struct ReplayFailure {
    pub block_index: u64,
    pub position: usize,
    pub reason: String,
}

/// Ledger rebuilt from a chain, plus every transaction that was skipped
#[derive(Debug, Clone, Default)]
pub struct Replay {
    pub accounts: AccountState,
    pub failures: Vec<ReplayFailure>,
}

/// Walks the chain and reports the first broken link, proof or timestamp
pub fn check_chain(chain: &[Block]) -> Result<(), ChainValidationError> {
    if let Some(genesis) = chain.first() {
        if genesis.index != 0 {
            return Err(ChainValidationError::GenesisIndex(genesis.index));
        }
    }

    for pair in chain.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);

        if current.index != previous.index + 1 {
            return Err(ChainValidationError::IndexGap {
                index: current.index,
                previous: previous.index,
            });
        }

        if current.previous_hash != previous.hash() {
            return Err(ChainValidationError::BrokenLink(current.index));
        }

        if !valid_proof(previous.proof, current.proof) {
            return Err(ChainValidationError::InvalidProof(current.index));
        }

        if current.timestamp < previous.timestamp {
            return Err(ChainValidationError::TimestampRegression(current.index));
        }
    }

    Ok(())
}

/// Determines if a given chain is structurally valid
pub fn valid_chain(chain: &[Block]) -> bool {
    check_chain(chain).is_ok()
}

/// Re-executes every transaction of `chain` in order on an empty ledger.
///
/// Transactions that fail validation are skipped and reported; the rest are
/// marked executed.
pub fn replay_chain(chain: &mut [Block]) -> Replay {
    let mut replay = Replay::default();

    for block in chain.iter_mut() {
        for (position, transaction) in block.transactions.iter_mut().enumerate() {
            transaction.executed = false;

            if let Err(err) = replay.accounts.execute(transaction) {
                warn!(
                    "Skipping transaction {} of block {} during replay: {}",
                    position, block.index, err
                );
                replay.failures.push(ReplayFailure {
                    block_index: block.index,
                    position,
                    reason: err.to_string(),
                });
            }
        }
    }

    replay
}
