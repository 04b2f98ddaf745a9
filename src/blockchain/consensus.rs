use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use std::collections::BTreeSet;
use std::time::Duration;

use super::account::AccountState;
use super::block::Block;
use super::validation::{check_chain, replay_chain};

/// Errors raised while talking to a peer or judging its chain.
///
/// None of these are fatal to resolution; they only exclude the peer.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("Peer {peer} is unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("Peer {peer} sent an unusable response: {reason}")]
    BadResponse { peer: String, reason: String },

    #[error("Peer {peer} served an invalid chain: {reason}")]
    InvalidChain { peer: String, reason: String },

    #[error("Peer {peer} chain of length {length} is not longer than {best}")]
    NotLonger { peer: String, length: usize, best: usize },
}

/// A chain as reported by a peer's chain endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerChain {
    pub chain: Vec<Block>,
    pub length: usize,
}

/// Source of peer chains
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Fetches the full chain a peer currently holds
    async fn fetch_chain(&self, peer: &str) -> Result<PeerChain, PeerError>;
}

/// Fetches peer chains over HTTP from their `/api/v1/chain` endpoint
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    /// Creates a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn fetch_chain(&self, peer: &str) -> Result<PeerChain, PeerError> {
        let url = format!("http://{}/api/v1/chain", peer);
        debug!("Fetching chain from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PeerError::Unreachable {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(PeerError::BadResponse {
                peer: peer.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        response
            .json::<PeerChain>()
            .await
            .map_err(|e| PeerError::BadResponse {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Normalizes a peer address to `host:port`.
///
/// Accepts full URLs (`http://192.168.0.5:5000/`) as well as bare
/// `host:port` pairs.
pub fn normalize_peer_address(address: &str) -> Result<String, PeerError> {
    let trimmed = address.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| PeerError::InvalidAddress(format!("{}: {}", address, e)))?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| PeerError::InvalidAddress(address.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| PeerError::InvalidAddress(address.to_string()))?;

    Ok(format!("{}:{}", host, port))
}

/// Outcome of a resolution round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Whether the local chain was swapped
    pub replaced: bool,

    /// Peers whose chain was not adopted, for diagnostics
    pub rejected_peers: BTreeSet<String>,
}

/// A peer chain that passed every check, with the ledger it produces
#[derive(Debug, Clone)]
pub struct Candidate {
    pub peer: String,
    pub chain: Vec<Block>,
    pub accounts: AccountState,
}

/// Result of comparing peer chains against the local length
#[derive(Debug, Default)]
pub struct Selection {
    pub candidate: Option<Candidate>,
    pub rejected: BTreeSet<String>,
}

/// Picks the longest valid chain among peer responses.
///
/// A chain must be strictly longer than `local_length` and than any
/// candidate seen before it, so ties keep the incumbent.
pub fn select_longest_valid(
    local_length: usize,
    responses: Vec<(String, Result<PeerChain, PeerError>)>,
) -> Selection {
    let mut selection = Selection::default();
    let mut best_length = local_length;

    for (peer, response) in responses {
        match evaluate(&peer, response, best_length) {
            Ok(candidate) => {
                debug!(
                    "Chain of {} blocks from {} is the new candidate",
                    candidate.chain.len(),
                    peer
                );
                best_length = candidate.chain.len();
                selection.candidate = Some(candidate);
            }
            Err(err) => {
                warn!("Rejecting chain: {}", err);
                selection.rejected.insert(peer);
            }
        }
    }

    selection
}

fn evaluate(
    peer: &str,
    response: Result<PeerChain, PeerError>,
    best_length: usize,
) -> Result<Candidate, PeerError> {
    let PeerChain { mut chain, length } = response?;

    if length != chain.len() {
        return Err(PeerError::InvalidChain {
            peer: peer.to_string(),
            reason: format!("reported length {} but served {} blocks", length, chain.len()),
        });
    }

    if chain.len() <= best_length {
        return Err(PeerError::NotLonger {
            peer: peer.to_string(),
            length: chain.len(),
            best: best_length,
        });
    }

    check_chain(&chain).map_err(|e| PeerError::InvalidChain {
        peer: peer.to_string(),
        reason: e.to_string(),
    })?;

    let replay = replay_chain(&mut chain);
    if let Some(failure) = replay.failures.first() {
        return Err(PeerError::InvalidChain {
            peer: peer.to_string(),
            reason: format!(
                "transaction {} of block {} does not execute: {}",
                failure.position, failure.block_index, failure.reason
            ),
        });
    }

    Ok(Candidate {
        peer: peer.to_string(),
        chain,
        accounts: replay.accounts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::test_utils::{build_chain, StaticPeers};
    use crate::blockchain::{Transaction, Wallet};

    fn served(chain: Vec<Block>) -> Result<PeerChain, PeerError> {
        Ok(PeerChain {
            length: chain.len(),
            chain,
        })
    }

    #[test]
    fn test_normalize_peer_address() {
        assert_eq!(
            normalize_peer_address("http://192.168.0.5:5000").unwrap(),
            "192.168.0.5:5000"
        );
        assert_eq!(
            normalize_peer_address("https://node.example.com:8443/api/").unwrap(),
            "node.example.com:8443"
        );
        assert_eq!(normalize_peer_address("localhost:5001").unwrap(), "localhost:5001");
        assert_eq!(normalize_peer_address(" 10.0.0.7:80 ").unwrap(), "10.0.0.7:80");
        assert_eq!(normalize_peer_address("http://node.local").unwrap(), "node.local:80");
        assert!(normalize_peer_address("").is_err());
        assert!(normalize_peer_address("http://").is_err());
    }

    #[test]
    fn test_longest_valid_chain_wins() {
        let miner = Wallet::new();
        let responses = vec![
            ("a:1".to_string(), served(build_chain(&miner, 4))),
            ("b:1".to_string(), served(build_chain(&miner, 5))),
            ("c:1".to_string(), served(build_chain(&miner, 2))),
        ];

        let selection = select_longest_valid(3, responses);

        let candidate = selection.candidate.unwrap();
        assert_eq!(candidate.peer, "b:1");
        assert_eq!(candidate.chain.len(), 5);
        assert_eq!(candidate.accounts.balance(miner.address()), Some(5));
        // "a:1" was a candidate before "b:1" outgrew it, so only "c:1" is rejected
        assert_eq!(selection.rejected, BTreeSet::from(["c:1".to_string()]));
    }

    #[test]
    fn test_ties_keep_incumbent() {
        let miner = Wallet::new();
        let chain = build_chain(&miner, 3);

        let selection = select_longest_valid(3, vec![("a:1".to_string(), served(chain.clone()))]);
        assert!(selection.candidate.is_none());
        assert!(selection.rejected.contains("a:1"));

        let selection = select_longest_valid(
            1,
            vec![
                ("a:1".to_string(), served(chain.clone())),
                ("b:1".to_string(), served(chain)),
            ],
        );
        assert_eq!(selection.candidate.unwrap().peer, "a:1");
        assert!(selection.rejected.contains("b:1"));
    }

    #[test]
    fn test_invalid_and_unreachable_peers_are_rejected() {
        let miner = Wallet::new();
        let mut tampered = build_chain(&miner, 5);
        tampered[2].proof += 1;

        let mut mislabeled = served(build_chain(&miner, 4)).unwrap();
        mislabeled.length = 9;

        let responses = vec![
            ("bad:1".to_string(), served(tampered)),
            ("liar:1".to_string(), Ok(mislabeled)),
            (
                "down:1".to_string(),
                Err(PeerError::Unreachable {
                    peer: "down:1".to_string(),
                    reason: "connection refused".to_string(),
                }),
            ),
        ];

        let selection = select_longest_valid(3, responses);

        assert!(selection.candidate.is_none());
        assert_eq!(selection.rejected.len(), 3);
    }

    #[test]
    fn test_chain_with_unfunded_transfer_is_rejected() {
        let miner = Wallet::new();
        let friend = Wallet::new();
        let mut chain = build_chain(&miner, 4);

        // Structurally fine because it sits in the last block, but overdraws
        let mut transfer =
            Transaction::new(miner.address().clone(), friend.address().clone(), 50, None);
        transfer.sign(&miner, 4).unwrap();
        chain[3].transactions.push(transfer);

        let selection = select_longest_valid(1, vec![("greedy:1".to_string(), served(chain))]);

        assert!(selection.candidate.is_none());
        assert!(selection.rejected.contains("greedy:1"));
    }

    #[tokio::test]
    async fn test_static_peers_serve_chains() {
        let miner = Wallet::new();
        let peers = StaticPeers::new()
            .with_chain("a:1", build_chain(&miner, 2))
            .with_unreachable("b:1");

        let chain = peers.fetch_chain("a:1").await.unwrap();
        assert_eq!(chain.length, 2);
        assert!(matches!(
            peers.fetch_chain("b:1").await,
            Err(PeerError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_client_treats_closed_port_as_unreachable() {
        let client = HttpPeerClient::new(Duration::from_millis(500)).unwrap();

        // Port 9 (discard) is not served on loopback in test environments
        let result = client.fetch_chain("127.0.0.1:9").await;
        assert!(matches!(result, Err(PeerError::Unreachable { .. })));
    }
}
