use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route(
                "/transactions/pending",
                web::get().to(handlers::get_pending_transactions),
            )
            .route("/transactions/new", web::post().to(handlers::new_transaction))
            .route(
                "/transactions/sign",
                web::post().to(handlers::sign_and_submit_transaction),
            )
            .route("/mine", web::post().to(handlers::mine_block))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/health", web::get().to(handlers::health))
            .route("/nodes", web::get().to(handlers::get_nodes))
            .route("/nodes/register", web::post().to(handlers::register_nodes))
            .route("/nodes/resolve", web::get().to(handlers::resolve_nodes))
            .route("/wallet/new", web::post().to(handlers::create_wallet))
            .route(
                "/wallet/balance/{address}",
                web::get().to(handlers::get_wallet_balance),
            )
            .route(
                "/wallet/transactions/{address}",
                web::get().to(handlers::get_wallet_transactions),
            )
            .route("/accounts", web::get().to(handlers::get_all_accounts)),
    );
}
