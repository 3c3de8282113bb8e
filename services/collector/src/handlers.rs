//! Control plane handlers for managing feed subscriptions

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use types::ids::ProductId;

use crate::error::AppError;
use crate::lifecycle::FeedStatus;
use crate::models::CoinResponse;
use crate::state::AppState;

fn parse_coin(coin: &str) -> Result<ProductId, AppError> {
    ProductId::try_new(coin).ok_or_else(|| AppError::BadRequest("Coin must be non-empty".into()))
}

pub async fn subscribe_coin(
    State(state): State<AppState>,
    Path(coin): Path<String>,
) -> Result<(StatusCode, Json<CoinResponse>), AppError> {
    let coin = parse_coin(&coin)?;
    state.subscriptions.start(coin.clone())?;
    Ok((
        StatusCode::CREATED,
        Json(CoinResponse {
            message: format!("Subscribed to {coin}"),
            coin,
        }),
    ))
}

pub async fn unsubscribe_coin(
    State(state): State<AppState>,
    Path(coin): Path<String>,
) -> Result<Json<CoinResponse>, AppError> {
    let coin = parse_coin(&coin)?;
    state.subscriptions.stop(&coin).await?;
    Ok(Json(CoinResponse {
        message: format!("Unsubscribed from {coin}"),
        coin,
    }))
}

pub async fn coin_status(
    State(state): State<AppState>,
    Path(coin): Path<String>,
) -> Result<Json<FeedStatus>, AppError> {
    let coin = parse_coin(&coin)?;
    state
        .subscriptions
        .status(&coin)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Not subscribed to {coin}")))
}

pub async fn list_coins(State(state): State<AppState>) -> Json<Vec<ProductId>> {
    Json(state.subscriptions.list())
}
