// Blockchain module
//
// This module contains the ledger node implementation including:
// - Block structure and canonical hashing
// - Proof of work
// - Transactions, signatures and account balances
// - Chain validation and replay
// - Consensus with peer nodes
// - Persistent storage

pub mod account;
pub mod block;
pub mod chain;
pub mod consensus;
pub mod crypto;
pub mod proof_of_work;
pub mod storage;
pub mod transaction;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export main components for easier access
pub use account::Account;
pub use block::Block;
pub use chain::{AddressHistory, Blockchain, BlockchainError, NodeHealth};
pub use consensus::{HttpPeerClient, PeerClient};
pub use crypto::{Address, DigitalSignature, NodeIdentity, Wallet};
pub use transaction::{Transaction, TransactionError};
