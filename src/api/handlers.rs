use actix_web::{web, HttpResponse, Responder};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::transaction::COINBASE_SENDER;
use crate::blockchain::{
    Block, Blockchain, BlockchainError, DigitalSignature, PeerClient, Transaction,
    TransactionError, Wallet,
};

/// Data structure for the blockchain state
pub type BlockchainData = web::Data<Blockchain>;

/// Client used to reach peers during conflict resolution
pub type PeerClientData = web::Data<dyn PeerClient>;

fn error_body(message: String) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

/// Maps a core error onto the matching HTTP status
fn error_response(err: &BlockchainError) -> HttpResponse {
    match err {
        BlockchainError::TransactionError(_) | BlockchainError::PeerError(_) => {
            HttpResponse::BadRequest().json(error_body(err.to_string()))
        }
        BlockchainError::MiningInterrupted => {
            HttpResponse::Conflict().json(error_body(err.to_string()))
        }
        BlockchainError::AccountError(_)
        | BlockchainError::StorageError(_)
        | BlockchainError::EmptyChain
        | BlockchainError::TaskFailed(_) => {
            error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(error_body(err.to_string()))
        }
    }
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// The length of the chain
    pub length: usize,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sender's address
    pub sender: String,

    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: u64,

    /// Optional note, covered by the signature
    #[serde(default)]
    pub message: Option<String>,

    /// bs58 signature over "{sender} {recipient} {message} {amount} {count}"
    pub signature: String,
}

/// Request for the sign-and-submit endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletTransactionRequest {
    /// The sender's secret key (hex encoded)
    pub private_key: String,

    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: u64,

    #[serde(default)]
    pub message: Option<String>,
}

/// Response for the transaction endpoints
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// The index of the block that will include this transaction
    pub block_index: u64,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

/// Request for the node registration endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterNodesRequest {
    /// Peer addresses, as URLs or `host:port`
    pub nodes: Vec<String>,
}

/// Response for the node registration endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterNodesResponse {
    pub message: String,

    /// Every peer now known, normalized to `host:port`
    pub total_nodes: Vec<String>,
}

/// Response for the conflict resolution endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ResolveResponse {
    pub message: String,

    /// Whether the local chain was replaced
    pub replaced: bool,

    /// Peers whose chain was not adopted
    pub rejected_peers: Vec<String>,

    /// The chain held after resolution
    pub chain: Vec<Block>,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The wallet's address
    pub address: String,

    /// The wallet's private key (hex encoded)
    pub private_key: String,
}

/// Response for the balance endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: String,

    pub balance: u64,

    /// The count the address's next signature must commit to
    pub transaction_count: u64,
}

/// Get the full blockchain
///
/// Returns the entire blockchain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(blockchain: BlockchainData) -> impl Responder {
    let (chain, length, is_valid) = blockchain.get_chain_with_validity();

    HttpResponse::Ok().json(ChainResponse {
        chain,
        length,
        is_valid,
    })
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (
            status = 200,
            description = "Pending transactions retrieved successfully",
            body = Vec<Transaction>
        )
    )
)]
pub async fn get_pending_transactions(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(blockchain.get_pending_transactions())
}

fn admitted(block_index: u64) -> HttpResponse {
    HttpResponse::Created().json(TransactionResponse {
        message: format!("Transaction will be added to Block {}", block_index),
        block_index,
    })
}

/// Submit a signed transaction
///
/// Admits a transaction signed by the sender into the pending pool
#[utoipa::path(
    post,
    path = "/api/v1/transactions/new",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction admitted", body = TransactionResponse),
        (status = 400, description = "Transaction rejected"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn new_transaction(
    blockchain: BlockchainData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let request = transaction_req.into_inner();

    // Only mining mints coins
    if request.sender == COINBASE_SENDER {
        let err = TransactionError::InvalidSenderAddress("coinbase sender is reserved".to_string());
        return HttpResponse::BadRequest().json(error_body(err.to_string()));
    }

    match blockchain.admit_transaction(
        &request.sender,
        &request.recipient,
        request.amount,
        Some(DigitalSignature(request.signature)),
        request.message,
    ) {
        Ok(block_index) => admitted(block_index),
        Err(err) => error_response(&err),
    }
}

/// Sign and submit a transaction
///
/// Signs with the supplied secret key and the sender's current transaction
/// count, then admits it. Meant for manual testing.
#[utoipa::path(
    post,
    path = "/api/v1/transactions/sign",
    request_body = WalletTransactionRequest,
    responses(
        (status = 201, description = "Transaction admitted", body = TransactionResponse),
        (status = 400, description = "Invalid key or transaction rejected"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn sign_and_submit_transaction(
    blockchain: BlockchainData,
    transaction_req: web::Json<WalletTransactionRequest>,
) -> impl Responder {
    let request = transaction_req.into_inner();

    let private_key_bytes = match hex::decode(&request.private_key) {
        Ok(bytes) => bytes,
        Err(_) => {
            return HttpResponse::BadRequest().json(error_body(
                "Invalid private key format. Must be a hex string.".to_string(),
            ));
        }
    };

    let wallet = match Wallet::from_secret_key(&private_key_bytes) {
        Ok(wallet) => wallet,
        Err(err) => {
            return HttpResponse::BadRequest()
                .json(error_body(format!("Invalid private key: {}", err)));
        }
    };

    let recipient = match request.recipient.parse() {
        Ok(recipient) => recipient,
        Err(_) => {
            let err = TransactionError::InvalidRecipientAddress(request.recipient);
            return HttpResponse::BadRequest().json(error_body(err.to_string()));
        }
    };

    let sender = wallet.address().clone();
    let count = blockchain.transaction_count(sender.as_str()).unwrap_or(0);
    let mut transaction = Transaction::new(sender, recipient, request.amount, request.message);
    if let Err(err) = transaction.sign(&wallet, count) {
        return HttpResponse::BadRequest()
            .json(error_body(format!("Failed to sign transaction: {}", err)));
    }

    match blockchain.admit_transaction(
        transaction.sender.to_string().as_str(),
        transaction.recipient.as_str(),
        transaction.amount,
        transaction.signature,
        transaction.message,
    ) {
        Ok(block_index) => admitted(block_index),
        Err(err) => error_response(&err),
    }
}

/// Mine a new block
///
/// Solves proof of work over the last block, credits the node with the
/// reward and forges every pending transaction into a block
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 409, description = "The chain tip changed while mining"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(blockchain: BlockchainData) -> impl Responder {
    let miner = blockchain.get_ref().clone();

    match web::block(move || miner.mine()).await {
        Ok(Ok(block)) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Forged".to_string(),
            block,
        }),
        Ok(Err(err)) => error_response(&err),
        Err(err) => {
            error!("Mining task failed: {}", err);
            HttpResponse::InternalServerError()
                .json(error_body(format!("Mining task failed: {}", err)))
        }
    }
}

/// Check if the blockchain is valid
///
/// Validates the entire blockchain
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = bool)
    )
)]
pub async fn validate_chain(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(blockchain.is_valid())
}

/// Node health
///
/// Reports whether the node loaded its chain cleanly
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Node is healthy", body = crate::blockchain::NodeHealth),
        (status = 503, description = "Node needs a resync", body = crate::blockchain::NodeHealth)
    )
)]
pub async fn health(blockchain: BlockchainData) -> impl Responder {
    let health = blockchain.health();

    if health.needs_resync {
        HttpResponse::ServiceUnavailable().json(health)
    } else {
        HttpResponse::Ok().json(health)
    }
}

/// Register peer nodes
#[utoipa::path(
    post,
    path = "/api/v1/nodes/register",
    request_body = RegisterNodesRequest,
    responses(
        (status = 201, description = "Nodes registered", body = RegisterNodesResponse),
        (status = 400, description = "Empty list or invalid address")
    )
)]
pub async fn register_nodes(
    blockchain: BlockchainData,
    nodes_req: web::Json<RegisterNodesRequest>,
) -> impl Responder {
    if nodes_req.nodes.is_empty() {
        return HttpResponse::BadRequest()
            .json(error_body("Please supply a valid list of nodes".to_string()));
    }

    for node in &nodes_req.nodes {
        if let Err(err) = blockchain.register_peer(node) {
            return error_response(&err);
        }
    }

    HttpResponse::Created().json(RegisterNodesResponse {
        message: "New nodes have been added".to_string(),
        total_nodes: blockchain.peers(),
    })
}

/// List known peer nodes
#[utoipa::path(
    get,
    path = "/api/v1/nodes",
    responses(
        (status = 200, description = "Known peers", body = Vec<String>)
    )
)]
pub async fn get_nodes(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(blockchain.peers())
}

/// Resolve conflicts with peers
///
/// Adopts the longest valid chain among peers if it beats the local one
#[utoipa::path(
    get,
    path = "/api/v1/nodes/resolve",
    responses(
        (status = 200, description = "Resolution finished", body = ResolveResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn resolve_nodes(
    blockchain: BlockchainData,
    peer_client: PeerClientData,
) -> impl Responder {
    match blockchain.resolve_consensus(peer_client.get_ref()).await {
        Ok((resolution, chain)) => {
            let message = if resolution.replaced {
                "Our chain was replaced"
            } else {
                "Our chain is authoritative"
            };

            HttpResponse::Ok().json(ResolveResponse {
                message: message.to_string(),
                replaced: resolution.replaced,
                rejected_peers: resolution.rejected_peers.into_iter().collect(),
                chain,
            })
        }
        Err(err) => error_response(&err),
    }
}

/// Create a new wallet
///
/// Creates a new wallet with a random keypair
///
/// The private key must be stored by your own
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 201, description = "Wallet created successfully", body = WalletResponse)
    )
)]
pub async fn create_wallet() -> impl Responder {
    let wallet = Wallet::new();

    HttpResponse::Created().json(WalletResponse {
        address: wallet.address().to_string(),
        private_key: hex::encode(wallet.export_secret_key()),
    })
}

/// Get wallet balance
///
/// Returns the balance of a wallet
#[utoipa::path(
    get,
    path = "/api/v1/wallet/balance/{address}",
    params(
        ("address" = String, Path, description = "Account address")
    ),
    responses(
        (status = 200, description = "Wallet balance retrieved", body = BalanceResponse),
        (status = 404, description = "Unknown address")
    )
)]
pub async fn get_wallet_balance(
    blockchain: BlockchainData,
    address: web::Path<String>,
) -> impl Responder {
    let address = address.into_inner();

    match blockchain.get_account(&address) {
        Some(account) => HttpResponse::Ok().json(BalanceResponse {
            address,
            balance: account.balance,
            transaction_count: account.transaction_count,
        }),
        None => HttpResponse::NotFound().json(error_body(format!("Unknown address: {}", address))),
    }
}

/// Get wallet transactions
///
/// Returns mined and pending transactions the address sent or received
#[utoipa::path(
    get,
    path = "/api/v1/wallet/transactions/{address}",
    params(
        ("address" = String, Path, description = "Account address")
    ),
    responses(
        (
            status = 200,
            description = "Transactions retrieved successfully",
            body = crate::blockchain::AddressHistory
        ),
        (status = 404, description = "Unknown address")
    )
)]
pub async fn get_wallet_transactions(
    blockchain: BlockchainData,
    address: web::Path<String>,
) -> impl Responder {
    match blockchain.get_transactions_for(&address) {
        Some(history) => HttpResponse::Ok().json(history),
        None => HttpResponse::NotFound().json(error_body(format!("Unknown address: {}", address))),
    }
}

/// Get all accounts
///
/// Returns all accounts in the blockchain
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (
            status = 200,
            description = "Accounts retrieved successfully",
            body = Vec<crate::blockchain::Account>
        )
    )
)]
pub async fn get_all_accounts(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(blockchain.get_all_accounts())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::test_utils::{build_chain, StaticPeers};
    use crate::blockchain::transaction::signing_message;
    use crate::blockchain::NodeIdentity;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn node() -> (Wallet, Blockchain) {
        let wallet = Wallet::new();
        let blockchain = Blockchain::new(NodeIdentity::from_wallet(&wallet)).unwrap();
        (wallet, blockchain)
    }

    fn balance(blockchain: &Blockchain, address: &str) -> Option<u64> {
        blockchain.get_account(address).map(|account| account.balance)
    }

    macro_rules! app {
        ($blockchain:expr, $peers:expr) => {{
            let peers: Arc<dyn PeerClient> = Arc::new($peers);
            test::init_service(
                App::new()
                    .app_data(web::Data::new($blockchain.clone()))
                    .app_data(web::Data::from(peers))
                    .configure(configure_routes),
            )
            .await
        }};
    }

    #[actix_web::test]
    async fn test_get_chain() {
        let (_, blockchain) = node();
        let app = app!(blockchain, StaticPeers::new());

        let req = test::TestRequest::get().uri("/api/v1/chain").to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(resp["length"], 1);
        assert_eq!(resp["chain"][0]["previous_hash"], "1");
        assert_eq!(resp["chain"][0]["transactions"][0]["sender"], "0");
        assert_eq!(resp["is_valid"], true);
    }

    #[actix_web::test]
    async fn test_signed_transaction_is_admitted() {
        let (wallet, blockchain) = node();
        let friend = Wallet::new();
        let app = app!(blockchain, StaticPeers::new());

        // Genesis reward makes the node's count 1
        let message = signing_message(wallet.address(), friend.address(), Some("hi"), 1, 1);
        let signature = wallet.sign(message.as_bytes());

        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/new")
            .set_json(serde_json::json!({
                "sender": wallet.address().to_string(),
                "recipient": friend.address().to_string(),
                "amount": 1,
                "message": "hi",
                "signature": signature.0,
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let uri = format!("/api/v1/wallet/balance/{}", friend.address());
        let req = test::TestRequest::get().uri(&uri).to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["balance"], 1);
        assert_eq!(resp["transaction_count"], 1);

        let uri = format!("/api/v1/wallet/transactions/{}", friend.address());
        let req = test::TestRequest::get().uri(&uri).to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["pending"][0]["message"], "hi");
    }

    #[actix_web::test]
    async fn test_rejected_transactions_map_to_bad_request() {
        let (wallet, blockchain) = node();
        let friend = Wallet::new();
        let app = app!(blockchain, StaticPeers::new());

        // Coinbase sender is refused from outside
        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/new")
            .set_json(serde_json::json!({
                "sender": "0",
                "recipient": friend.address().to_string(),
                "amount": 100,
                "signature": "",
            }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        // Overdraft
        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/sign")
            .set_json(serde_json::json!({
                "private_key": hex::encode(wallet.export_secret_key()),
                "recipient": friend.address().to_string(),
                "amount": 2,
            }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        assert_eq!(balance(&blockchain, friend.address().as_str()), None);
    }

    #[actix_web::test]
    async fn test_wallet_transfer_and_mine() {
        let (wallet, blockchain) = node();
        let friend = Wallet::new();
        let app = app!(blockchain, StaticPeers::new());

        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/sign")
            .set_json(serde_json::json!({
                "private_key": hex::encode(wallet.export_secret_key()),
                "recipient": friend.address().to_string(),
                "amount": 1,
            }))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["block_index"], 1);

        // Only the sign-and-submit path accepts secret keys
        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/wallet")
            .set_json(serde_json::json!({
                "private_key": hex::encode(wallet.export_secret_key()),
                "recipient": friend.address().to_string(),
                "amount": 1,
            }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post().uri("/api/v1/mine").to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["block"]["index"], 1);
        assert_eq!(resp["block"]["transactions"].as_array().unwrap().len(), 2);

        assert_eq!(balance(&blockchain, wallet.address().as_str()), Some(1));
        assert_eq!(balance(&blockchain, friend.address().as_str()), Some(1));
    }

    #[actix_web::test]
    async fn test_unknown_address_is_not_found() {
        let (_, blockchain) = node();
        let app = app!(blockchain, StaticPeers::new());

        let uri = format!("/api/v1/wallet/balance/{}", Wallet::new().address());
        let req = test::TestRequest::get().uri(&uri).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/api/v1/wallet/transactions/0").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_register_and_resolve() {
        let (_, blockchain) = node();
        let peer_chain = build_chain(&Wallet::new(), 4);
        let peers = StaticPeers::new().with_chain("10.0.0.2:5000", peer_chain);
        let app = app!(blockchain, peers);

        let req = test::TestRequest::post()
            .uri("/api/v1/nodes/register")
            .set_json(serde_json::json!({ "nodes": ["http://10.0.0.2:5000", "10.0.0.3:5000"] }))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["total_nodes"], serde_json::json!(["10.0.0.2:5000", "10.0.0.3:5000"]));

        let req = test::TestRequest::get().uri("/api/v1/nodes/resolve").to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["replaced"], true);
        assert_eq!(resp["rejected_peers"], serde_json::json!(["10.0.0.3:5000"]));
        assert_eq!(resp["chain"].as_array().unwrap().len(), 4);

        let req = test::TestRequest::post()
            .uri("/api/v1/nodes/register")
            .set_json(serde_json::json!({ "nodes": [] }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_health() {
        let (_, blockchain) = node();
        let app = app!(blockchain, StaticPeers::new());

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
