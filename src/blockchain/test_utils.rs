use async_trait::async_trait;
use chrono::{Duration, Utc};

use std::collections::HashMap;

use super::block::{Block, GENESIS_PREVIOUS_HASH, GENESIS_PROOF};
use super::consensus::{PeerChain, PeerClient, PeerError};
use super::proof_of_work::proof_of_work;
use super::transaction::Transaction;
use super::Wallet;

/// Builds a valid chain of `length` blocks, each minting 1 to `miner`
pub fn build_chain(miner: &Wallet, length: usize) -> Vec<Block> {
    let genesis = Block::new(
        0,
        Utc::now(),
        vec![Transaction::new_coinbase(miner.address().clone(), 1)],
        GENESIS_PROOF,
        GENESIS_PREVIOUS_HASH.to_string(),
    );

    let mut chain = vec![genesis];
    extend_chain(&mut chain, miner, length.saturating_sub(1));
    chain
}

/// Appends `count` valid blocks to `chain`, each minting 1 to `miner`
pub fn extend_chain(chain: &mut Vec<Block>, miner: &Wallet, count: usize) {
    for _ in 0..count {
        let previous = chain.last().unwrap();
        let block = Block::new(
            previous.index + 1,
            previous.timestamp + Duration::seconds(1),
            vec![Transaction::new_coinbase(miner.address().clone(), 1)],
            proof_of_work(previous.proof),
            previous.hash(),
        );
        chain.push(block);
    }
}

/// Peer client serving canned chains; unknown peers are unreachable
#[derive(Debug, Default)]
pub struct StaticPeers {
    chains: HashMap<String, Option<Vec<Block>>>,
}

impl StaticPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, peer: &str, chain: Vec<Block>) -> Self {
        self.chains.insert(peer.to_string(), Some(chain));
        self
    }

    pub fn with_unreachable(mut self, peer: &str) -> Self {
        self.chains.insert(peer.to_string(), None);
        self
    }
}

#[async_trait]
impl PeerClient for StaticPeers {
    async fn fetch_chain(&self, peer: &str) -> Result<PeerChain, PeerError> {
        match self.chains.get(peer) {
            Some(Some(chain)) => Ok(PeerChain {
                length: chain.len(),
                chain: chain.clone(),
            }),
            _ => Err(PeerError::Unreachable {
                peer: peer.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}
