use serde::Serialize;
use types::ids::ProductId;

#[derive(Debug, Clone, Serialize)]
pub struct CoinResponse {
    pub coin: ProductId,
    pub message: String,
}
