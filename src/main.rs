use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::sync::Arc;

mod api;
mod blockchain;
mod config;

use blockchain::{Address, Blockchain, HttpPeerClient, NodeIdentity, PeerClient, Wallet};
use config::NodeConfig;

/// Resolves the identity credited with mining rewards
fn node_identity(config: &NodeConfig) -> anyhow::Result<NodeIdentity> {
    if let Some(address) = &config.node_address {
        let address: Address = address
            .parse()
            .with_context(|| format!("invalid node address {}", address))?;
        return Ok(NodeIdentity::new(address));
    }

    let wallet = Wallet::new();
    info!("Created node wallet with address: {}", wallet.address());
    info!("Node wallet private key: {}", hex::encode(wallet.export_secret_key()));

    Ok(NodeIdentity::from_wallet(&wallet))
}

fn initialize_blockchain(
    config: &NodeConfig,
    identity: NodeIdentity,
) -> anyhow::Result<Blockchain> {
    let blockchain = if config.in_memory {
        info!("Keeping the chain in memory");
        Blockchain::new(identity)?
    } else {
        let blockchain = Blockchain::with_storage(&config.data_dir, identity)
            .with_context(|| format!("failed to open storage at {}", config.data_dir.display()))?;
        info!("Loaded blockchain from storage at {}", config.data_dir.display());
        blockchain
    };

    for peer in &config.peers {
        blockchain
            .register_peer(peer)
            .with_context(|| format!("invalid peer {}", peer))?;
    }

    let health = blockchain.health();
    if health.needs_resync {
        warn!("Node needs a resync: {}", health.problems.join("; "));
    }

    Ok(blockchain)
}

/// Resolves conflicts with peers on a fixed interval
fn spawn_periodic_resolution(
    blockchain: Blockchain,
    peer_client: Arc<dyn PeerClient>,
    period: std::time::Duration,
) {
    info!("Resolving conflicts with peers every {:?}", period);

    actix_web::rt::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match blockchain.resolve_conflicts(peer_client.as_ref()).await {
                Ok(resolution) if resolution.replaced => {
                    info!("Periodic resolution replaced the chain")
                }
                Ok(_) => {}
                Err(err) => warn!("Periodic resolution failed: {}", err),
            }
        }
    });
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::get_pending_transactions,
        api::handlers::new_transaction,
        api::handlers::sign_and_submit_transaction,
        api::handlers::mine_block,
        api::handlers::validate_chain,
        api::handlers::health,
        api::handlers::register_nodes,
        api::handlers::get_nodes,
        api::handlers::resolve_nodes,
        api::handlers::create_wallet,
        api::handlers::get_wallet_balance,
        api::handlers::get_wallet_transactions,
        api::handlers::get_all_accounts
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::Account,
            blockchain::AddressHistory,
            blockchain::NodeHealth,
            blockchain::crypto::Address,
            blockchain::crypto::DigitalSignature,
            api::handlers::ChainResponse,
            api::handlers::TransactionRequest,
            api::handlers::WalletTransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MineResponse,
            api::handlers::RegisterNodesRequest,
            api::handlers::RegisterNodesResponse,
            api::handlers::ResolveResponse,
            api::handlers::WalletResponse,
            api::handlers::BalanceResponse
        )
    ),
    tags(
        (name = "ledger", description = "Proof-of-work ledger node endpoints")
    ),
    info(
        title = "Ledger Node API",
        version = "1.0.0",
        description = "A proof-of-work ledger node with longest-valid-chain consensus",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::parse();

    let identity = node_identity(&config)?;
    let blockchain = initialize_blockchain(&config, identity)?;

    let peer_client: Arc<dyn PeerClient> = Arc::new(
        HttpPeerClient::new(config.peer_timeout()).context("failed to build peer client")?,
    );

    if let Some(period) = config.resolve_interval() {
        spawn_periodic_resolution(blockchain.clone(), peer_client.clone(), period);
    }

    let blockchain = web::Data::new(blockchain);
    let peer_client = web::Data::from(peer_client);

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(blockchain.clone())
            .app_data(peer_client.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
