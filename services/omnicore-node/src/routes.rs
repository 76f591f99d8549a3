use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::telemetry;

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/register/init", post(handlers::register_init))
        .route("/register/complete", post(handlers::register_complete))
        .route("/auth/verify", post(handlers::verify_session))
        .route("/auth/logout", post(handlers::logout))
        .route("/keys/send", post(handlers::send_encrypted))
        .route("/admin/login", post(handlers::admin_login))
        .route("/clients", get(handlers::list_clients))
        .route("/clients/stats", get(handlers::client_stats))
        .route("/clients/:client_id", delete(handlers::remove_client))
        .route("/servers", get(handlers::all_servers))
        .route("/servers/public", get(handlers::public_servers))
        .route("/servers/stats", get(handlers::server_stats))
        .route("/servers/register", post(handlers::register_server))
        .route("/servers/challenge", post(handlers::server_challenge))
        .route("/servers/sync", post(handlers::server_sync))
        .route("/servers/:server_id", delete(handlers::deregister_server))
        .route("/servers/:server_id/trust", put(handlers::set_trust));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(telemetry::render))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(telemetry::track_http)),
        )
}
