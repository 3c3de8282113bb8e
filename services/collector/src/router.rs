use crate::handlers;
use crate::state::AppState;
use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/coins", get(handlers::list_coins))
        .route(
            "/coins/{coin}",
            get(handlers::coin_status)
                .post(handlers::subscribe_coin)
                .delete(handlers::unsubscribe_coin),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
