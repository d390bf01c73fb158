use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json,
    extract::{
        ConnectInfo, Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{AppendHeaders, IntoResponse},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    device::{self, DeviceToken},
    error::AppError,
    state::AppState,
    tickets::{self, CheckIn, parse_qr_data},
    votes::{self, VoteReceipt, VoteRequest},
};

pub async fn vote_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<VoteReceipt>, AppError> {
    let Json(request) = payload?;

    let receipt = votes::submit(&state, request, &headers, Some(peer.ip())).await?;

    Ok(Json(receipt))
}

#[derive(Deserialize, Debug, Default)]
pub struct RedeemRequest {
    #[serde(default)]
    pub event_id: Option<i64>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub qr_data: Option<String>,
}

/// Query string of the validation URL printed on the ticket.
#[derive(Deserialize, Debug, Default)]
pub struct ValidateQuery {
    pub e: Option<i64>,
    pub c: Option<String>,
    pub s: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TicketSummary {
    pub event_id: i64,
    pub code: String,
    pub player_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub valid: bool,
    pub already_redeemed: bool,
    pub ticket: TicketSummary,
}

impl From<CheckIn> for Redemption {
    fn from(check_in: CheckIn) -> Self {
        Self {
            valid: true,
            already_redeemed: check_in.already_redeemed,
            ticket: TicketSummary {
                event_id: check_in.vote.event_id,
                code: check_in.vote.code,
                player_id: check_in.vote.player_id,
                created_at: check_in.vote.created_at,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TicketStatus {
    pub event_id: i64,
    pub code: String,
    pub redeemed: bool,
    pub redeemed_at: Option<DateTime<Utc>>,
}

async fn check_in(
    state: &AppState,
    event_id: i64,
    code: &str,
    signature: &str,
) -> Result<Json<Redemption>, AppError> {
    let check_in = tickets::check_in(
        state.store.as_ref(),
        &state.secrets,
        event_id,
        code,
        signature,
        state.clock.now(),
    )
    .await?;

    Ok(Json(check_in.into()))
}

pub async fn redeem_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RedeemRequest>, JsonRejection>,
) -> Result<Json<Redemption>, AppError> {
    let Json(request) = payload?;

    let (event_id, code, signature) = match request.qr_data.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            let scanned = parse_qr_data(raw)?;

            let event_id = match (request.event_id, scanned.event_id) {
                (Some(body), Some(scanned)) if body != scanned => {
                    return Err(AppError::MalformedPayload);
                }
                (body, scanned) => body.or(scanned),
            };

            (event_id, Some(scanned.code), Some(scanned.signature))
        }
        _ => (request.event_id, request.code, request.signature),
    };

    let (Some(event_id), Some(code), Some(signature)) = (event_id, code, signature) else {
        return Err(AppError::MissingParameters);
    };

    check_in(&state, event_id, &code, &signature).await
}

pub async fn validate_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ValidateQuery>, QueryRejection>,
) -> Result<Json<Redemption>, AppError> {
    let Query(query) = query?;

    let (Some(event_id), Some(code), Some(signature)) = (query.e, query.c, query.s) else {
        return Err(AppError::MissingParameters);
    };

    check_in(&state, event_id, &code, &signature).await
}

pub async fn ticket_handler(
    State(state): State<Arc<AppState>>,
    Path((event_id, code)): Path<(i64, String)>,
) -> Result<Json<TicketStatus>, AppError> {
    let ticket = tickets::validate(state.store.as_ref(), event_id, &code).await?;

    Ok(Json(TicketStatus {
        event_id: ticket.event_id,
        code: ticket.code,
        redeemed: ticket.redeemed_at.is_some(),
        redeemed_at: ticket.redeemed_at,
    }))
}

pub async fn device_token_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token: DeviceToken = device::issue(&headers, state.clock.now());
    let cookie = device::set_cookie(&token, &headers);

    (AppendHeaders([(SET_COOKIE, cookie)]), Json(token))
}

pub async fn liveness_handler(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.store.ping().await.map_err(|e| {
        error!("Liveness check failed: {e}");
        AppError::Unavailable
    })?;

    Ok(StatusCode::OK)
}
