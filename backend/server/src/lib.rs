//! Vote integrity backend for live MVP voting at sporting events.
//!
//! Fans scan a QR code at the venue, pick a player and get back a lottery ticket. The
//! ticket is checked in at the prize desk. Everything else (teams, players, events,
//! sponsors, admin) lives in the CRUD service, this crate only guards the vote.
//!
//!
//!
//! # Threat Model
//!
//! **Goal**: One vote per device per event, without accounts and without storing anything
//! that identifies a person.
//!
//! - Device fingerprint is normalized and hashed with the event and the UTC day, the raw
//!   attributes are never stored
//! - Client IP is truncated to its /24 or /64 and keyed-hashed, only used for throttling
//! - A fingerprint lock serializes concurrent attempts from the same device
//! - A fingerprint record blocks that device for the rest of the retention window
//! - Staff can hand out signed single-use bypass codes for shared or misreported devices
//! - Device token cookie and hashed IP are rate limited with sliding windows
//!
//!
//!
//! # Vote Flow
//!
//! ```text
//! POST /vote
//!   -> hashed ip, fingerprint entropy or bypass code signature     400
//!   -> event active and open                                       409
//!   -> device / ip rate limit                                      429
//!   -> fingerprint lock                                            409
//!   -> code + vote + ticket in one store write                     409 / 500
//!   <- { code, signature, qr_data, message }
//! ```
//!
//!
//!
//! # Ticket Flow
//!
//! - `qr_data` is `{TICKET_BASE_URL}/lottery/validate?e=&c=&s=`
//! - The prize desk page calls `GET /tickets/validate` with the same query, or posts it to
//!   `POST /tickets/redeem`
//! - First scan redeems, every later scan succeeds with `already_redeemed: true`
//!
//!
//!
//! # Endpoints
//!
//! | Method | Path                                 |                              |
//! |--------|--------------------------------------|------------------------------|
//! | POST   | `/vote`                              | submit a vote                |
//! | POST   | `/tickets/redeem`                    | redeem by body or `qr_data`  |
//! | GET    | `/tickets/validate?e=&c=&s=`         | redeem from the ticket link  |
//! | GET    | `/events/{event_id}/tickets/{code}`  | read ticket state            |
//! | GET    | `/device-token`                      | issue the device cookie      |
//! | GET    | `/liveness`                          | store ping                   |
//!
//! Errors are `{ "error": "snake_case_code" }`.
//!
//!
//!
//! # Configuration
//!
//! Secrets come from `/run/secrets/{NAME}` (Docker secrets), falling back to the
//! environment: `VOTE_SECRET`, `HMAC_IP_KEY`, `HMAC_CODE_KEY`.
//!
//! Everything else is an environment variable with a default, see [`config::Config`].
//!
//! ```sh
//! VOTE_STORE=memory VOTE_DEV_EVENT=1 VOTE_SECRET=dev HMAC_IP_KEY=dev HMAC_CODE_KEY=dev \
//!     RUST_LOG=info cargo run -p mvpvote
//! ```
//!
//!
//!
//! # Notes
//!
//! ## Rate Limiting
//! Limiter state is per process. Behind more than one replica each replica enforces its
//! own window, the fingerprint lock and the store remain the real guarantee.
//!
//! ## Daily Hash Rotation
//! The fingerprint hash includes the UTC date, so a device that voted at 23:59 can vote
//! again at 00:01 for a multi-day event. Accepted, events are single evenings.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod bypass;
pub mod clock;
pub mod codes;
pub mod config;
pub mod database;
pub mod device;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod lock;
pub mod network;
pub mod rate_limit;
pub mod routes;
pub mod secrets;
pub mod state;
pub mod store;
pub mod sweeper;
pub mod tickets;
pub mod votes;


use config::Config;
use error::ServerError;
use routes::{
    device_token_handler, liveness_handler, redeem_handler, ticket_handler, validate_handler,
    vote_handler,
};
use secrets::Secrets;
use state::AppState;
use sweeper::spawn_sweeper;

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/vote", post(vote_handler))
        .route("/tickets/redeem", post(redeem_handler))
        .route("/tickets/validate", get(validate_handler))
        .route("/events/{event_id}/tickets/{code}", get(ticket_handler))
        .route("/device-token", get(device_token_handler))
        .route("/liveness", get(liveness_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() -> Result<(), ServerError> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading configuration...");
    let config = Config::load()?;
    let secrets = Secrets::load()?;

    info!("Initializing state...");
    let state = AppState::new(config, secrets).await?;

    let sweeper = spawn_sweeper(state.clone());

    info!("Starting server...");
    let app = build_router(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    info!("Server shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
