use std::path::Path;

use log::debug;
use sled::{Batch, Db, Tree};
use thiserror::Error;

use super::block::Block;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Stored chain is not contiguous: expected block {expected}, found {found}")]
    Gap { expected: u64, found: u64 },
}

/// Storage for blockchain data
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Blocks keyed by big-endian index
    blocks: Tree,

    /// Known peers keyed by `host:port`
    peers: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage")
            .field("blocks", &self.blocks.len())
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let peers = db.open_tree("peers")?;

        Ok(Self { db, blocks, peers })
    }

    fn encode_block(block: &Block) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(block).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    /// Saves a block and flushes it to disk
    pub fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let value = Self::encode_block(block)?;
        self.blocks.insert(block.index.to_be_bytes(), value)?;
        self.flush()?;

        debug!("Persisted block {}", block.index);
        Ok(())
    }

    /// Replaces the whole stored chain with `chain`
    pub fn replace_chain(&self, chain: &[Block]) -> Result<(), StorageError> {
        let mut batch = Batch::default();

        for key in self.blocks.iter().keys() {
            batch.remove(key?);
        }
        for block in chain {
            batch.insert(block.index.to_be_bytes().to_vec(), Self::encode_block(block)?);
        }

        self.blocks.apply_batch(batch)?;
        self.flush()?;

        debug!("Persisted replacement chain of {} blocks", chain.len());
        Ok(())
    }

    /// Loads every stored block in index order
    pub fn get_all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();

        // Big-endian keys iterate in index order
        for value in self.blocks.iter().values() {
            let expected = blocks.len() as u64;
            let block: Block = bincode::deserialize(&value?).map_err(|e| {
                StorageError::DeserializationError(format!(
                    "Failed to deserialize block {}: {}",
                    expected, e
                ))
            })?;

            if block.index != expected {
                return Err(StorageError::Gap {
                    expected,
                    found: block.index,
                });
            }

            blocks.push(block);
        }

        Ok(blocks)
    }

    /// Records a peer address
    pub fn save_peer(&self, peer: &str) -> Result<(), StorageError> {
        self.peers.insert(peer.as_bytes(), Vec::new())?;
        self.flush()
    }

    /// Gets all recorded peer addresses
    pub fn get_all_peers(&self) -> Result<Vec<String>, StorageError> {
        self.peers
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                String::from_utf8(key.to_vec())
                    .map_err(|e| StorageError::DeserializationError(e.to_string()))
            })
            .collect()
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
