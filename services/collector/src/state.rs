use crate::lifecycle::SubscriptionManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub subscriptions: Arc<SubscriptionManager>,
}

impl AppState {
    pub fn new(subscriptions: Arc<SubscriptionManager>) -> Self {
        Self { subscriptions }
    }
}
