use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use super::transaction::Transaction;

/// `previous_hash` carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "1";

/// Proof carried by the genesis block
pub const GENESIS_PROOF: u64 = 100;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Timestamp when the block was forged
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// Executed transactions packaged in this block
    pub transactions: Vec<Transaction>,

    /// Proof of work solution
    pub proof: u64,

    /// Hash of the previous block
    pub previous_hash: String,
}

impl Block {
    /// Creates a new block
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `timestamp` - When the block was forged
    /// * `transactions` - The list of transactions to include in the block
    /// * `proof` - The proof of work solution
    /// * `previous_hash` - The hash of the previous block
    pub fn new(
        index: u64,
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
        proof: u64,
        previous_hash: String,
    ) -> Self {
        Block {
            index,
            timestamp,
            transactions,
            proof,
            previous_hash,
        }
    }

    /// Calculates the canonical hash of the block
    ///
    /// The fields go through a `serde_json::Value`, whose object keys are
    /// sorted, so the digest does not depend on how the block was decoded.
    ///
    /// # Returns
    ///
    /// The SHA-256 hash of the block as a hexadecimal string
    pub fn hash(&self) -> String {
        let block_data = serde_json::json!({
            "index": self.index,
            "previous_hash": self.previous_hash,
            "proof": self.proof,
            "timestamp": self.timestamp,
            "transactions": self.transactions,
        });

        format!("{:x}", Sha256::digest(block_data.to_string().as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Address;

    fn sample_block() -> Block {
        let transactions = vec![
            Transaction::new_coinbase(Address("recipient1".to_string()), 10),
            Transaction::new_coinbase(Address("recipient2".to_string()), 20),
        ];

        Block::new(1, Utc::now(), transactions, 100, "previous_hash".to_string())
    }

    #[test]
    fn test_new_block() {
        let block = sample_block();

        assert_eq!(block.index, 1);
        assert_eq!(block.proof, 100);
        assert_eq!(block.previous_hash, "previous_hash");
        assert_eq!(block.transactions.len(), 2);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let block = sample_block();

        let hash = block.hash();
        assert_eq!(hash.len(), 64); // SHA-256 hash is 64 characters in hex
        assert_eq!(hash, block.hash());
        assert_eq!(hash, block.clone().hash());
    }

    #[test]
    fn test_hash_survives_serialization() {
        let block = sample_block();

        let from_json: Block =
            serde_json::from_str(&serde_json::to_string(&block).unwrap()).unwrap();
        assert_eq!(from_json.hash(), block.hash());

        let from_bincode: Block =
            bincode::deserialize(&bincode::serialize(&block).unwrap()).unwrap();
        assert_eq!(from_bincode.hash(), block.hash());
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let block = sample_block();
        let value = serde_json::to_value(&block).unwrap();

        let reordered = format!(
            r#"{{"transactions":{},"timestamp":{},"proof":{},"previous_hash":{},"index":{}}}"#,
            value["transactions"],
            value["timestamp"],
            value["proof"],
            value["previous_hash"],
            value["index"]
        );
        let decoded: Block = serde_json::from_str(&reordered).unwrap();

        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_hash_changes_with_every_field() {
        let block = sample_block();
        let original = block.hash();

        let mut changed = block.clone();
        changed.index += 1;
        assert_ne!(changed.hash(), original);

        let mut changed = block.clone();
        changed.timestamp = changed.timestamp + chrono::Duration::seconds(1);
        assert_ne!(changed.hash(), original);

        let mut changed = block.clone();
        changed.proof += 1;
        assert_ne!(changed.hash(), original);

        let mut changed = block.clone();
        changed.previous_hash.push('0');
        assert_ne!(changed.hash(), original);

        let mut changed = block.clone();
        changed.transactions[0].amount += 1;
        assert_ne!(changed.hash(), original);

        let mut changed = block;
        changed.transactions.pop();
        assert_ne!(changed.hash(), original);
    }

    #[test]
    fn test_executed_flag_does_not_affect_hash() {
        let block = sample_block();
        let mut executed = block.clone();
        executed.transactions[0].executed = true;

        assert_eq!(executed.hash(), block.hash());
    }
}
