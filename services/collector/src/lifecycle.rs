//! Subscription lifecycle
//!
//! Tracks one feed per instrument. A feed is two connector tasks sharing
//! a cancellation token: the main connection (candles, trades, ticker)
//! and a dedicated level2 connection with its own book. Start spawns
//! both, stop cancels and awaits both, status reports each task's state.

use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use types::ids::ProductId;

use crate::config::ApiKey;
use crate::connector::{Channel, FeedConnector, L2_CHANNELS, MAIN_CHANNELS};
use crate::error::{AppError, FeedError};
use crate::sink::RowSink;
use crate::transport::FeedTransport;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(ProductId),

    #[error("Not subscribed to {0}")]
    NotSubscribed(ProductId),
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        let message = err.to_string();
        match err {
            LifecycleError::AlreadySubscribed(_) => AppError::Conflict(message),
            LifecycleError::NotSubscribed(_) => AppError::NotFound(message),
        }
    }
}

/// Final result recorded by a connector task.
#[derive(Debug, Clone)]
enum TaskOutcome {
    Done,
    Cancelled,
    Failed(String),
}

/// Externally visible state of one connector task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Done,
    Cancelled,
    Failed,
}

struct TaskEntry {
    // Taken by `stop` for the drain; `None` marks a stop in flight.
    handle: Option<JoinHandle<()>>,
    outcome: Arc<Mutex<Option<TaskOutcome>>>,
}

impl TaskEntry {
    fn state(&self) -> TaskState {
        if self.handle.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return TaskState::Running;
        }
        match self.outcome.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(TaskOutcome::Done) => TaskState::Done,
                Some(TaskOutcome::Cancelled) => TaskState::Cancelled,
                Some(TaskOutcome::Failed(_)) => TaskState::Failed,
                // No outcome yet: either a stop is draining the task, or it
                // finished without recording one, which means it panicked.
                None if self.handle.is_none() => TaskState::Cancelled,
                None => TaskState::Failed,
            },
            Err(_) => TaskState::Failed,
        }
    }
}

struct FeedHandle {
    cancel: CancellationToken,
    main: TaskEntry,
    level2: TaskEntry,
}

/// Per-task status for one subscribed instrument.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub product_id: ProductId,
    pub main: TaskState,
    pub level2: TaskState,
}

/// Registry of live feeds, shared across control plane handlers.
pub struct SubscriptionManager {
    feeds: DashMap<ProductId, FeedHandle>,
    sink: Arc<dyn RowSink>,
    transport: Arc<dyn FeedTransport>,
    api_key: ApiKey,
}

impl SubscriptionManager {
    pub fn new(
        sink: Arc<dyn RowSink>,
        transport: Arc<dyn FeedTransport>,
        api_key: ApiKey,
    ) -> Self {
        Self {
            feeds: DashMap::new(),
            sink,
            transport,
            api_key,
        }
    }

    /// Spawn the instrument's connector tasks, refusing duplicates.
    pub fn start(&self, product_id: ProductId) -> Result<(), LifecycleError> {
        match self.feeds.entry(product_id.clone()) {
            Entry::Occupied(_) => Err(LifecycleError::AlreadySubscribed(product_id)),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                let main = self.spawn_connector(&product_id, MAIN_CHANNELS, &cancel);
                let level2 = self.spawn_connector(&product_id, L2_CHANNELS, &cancel);
                slot.insert(FeedHandle {
                    cancel,
                    main,
                    level2,
                });
                info!(product_id = %product_id, "subscription started");
                Ok(())
            }
        }
    }

    fn spawn_connector(
        &self,
        product_id: &ProductId,
        channels: &[Channel],
        cancel: &CancellationToken,
    ) -> TaskEntry {
        let connector = FeedConnector::new(
            product_id.clone(),
            channels.to_vec(),
            self.api_key.clone(),
            self.sink.clone(),
        );
        let transport = self.transport.clone();
        let cancel = cancel.clone();
        let outcome: Arc<Mutex<Option<TaskOutcome>>> = Arc::new(Mutex::new(None));
        let recorder = outcome.clone();
        let task_product = product_id.clone();

        let handle = tokio::spawn(async move {
            let recorded = match connector.run(transport, cancel).await {
                Ok(()) => TaskOutcome::Done,
                Err(FeedError::Cancelled) => TaskOutcome::Cancelled,
                Err(err) => {
                    error!(
                        product_id = %task_product,
                        error = %err,
                        "connector task failed"
                    );
                    TaskOutcome::Failed(err.to_string())
                }
            };
            if let Ok(mut slot) = recorder.lock() {
                *slot = Some(recorded);
            }
        });

        TaskEntry {
            handle: Some(handle),
            outcome,
        }
    }

    /// Cancel the instrument's tasks and wait for both to finish.
    ///
    /// The registry entry stays in place until the drain completes, so a
    /// concurrent `start` for the same instrument conflicts instead of
    /// doubling up the tasks.
    pub async fn stop(&self, product_id: &ProductId) -> Result<(), LifecycleError> {
        let (cancel, main, level2) = {
            let mut feed = self
                .feeds
                .get_mut(product_id)
                .ok_or_else(|| LifecycleError::NotSubscribed(product_id.clone()))?;
            let (Some(main), Some(level2)) = (feed.main.handle.take(), feed.level2.handle.take())
            else {
                // Another stop already owns the drain.
                return Err(LifecycleError::NotSubscribed(product_id.clone()));
            };
            (feed.cancel.clone(), main, level2)
        };

        cancel.cancel();
        for (task, handle) in [("main", main), ("level2", level2)] {
            if let Err(err) = handle.await {
                error!(
                    product_id = %product_id,
                    task,
                    error = %err,
                    "connector task panicked"
                );
            }
        }
        self.feeds.remove(product_id);
        info!(product_id = %product_id, "subscription stopped");
        Ok(())
    }

    pub fn status(&self, product_id: &ProductId) -> Option<FeedStatus> {
        self.feeds.get(product_id).map(|feed| FeedStatus {
            product_id: product_id.clone(),
            main: feed.main.state(),
            level2: feed.level2.state(),
        })
    }

    /// Currently subscribed instruments, sorted for stable output.
    pub fn list(&self) -> Vec<ProductId> {
        let mut ids: Vec<ProductId> = self.feeds.iter().map(|entry| entry.key().clone()).collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Stop every feed. Used on service shutdown.
    pub async fn shutdown(&self) {
        for product_id in self.list() {
            if let Err(err) = self.stop(&product_id).await {
                debug!(product_id = %product_id, error = %err, "feed already gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::testkey::test_api_key;
    use crate::sink::RecordingSink;
    use crate::transport::{FeedConnection, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Connects instantly, then holds the stream open until cancelled.
    struct HoldOpenTransport;

    struct HoldOpenConnection;

    #[async_trait]
    impl FeedTransport for HoldOpenTransport {
        async fn connect(&self) -> Result<Box<dyn FeedConnection>, TransportError> {
            Ok(Box::new(HoldOpenConnection))
        }
    }

    #[async_trait]
    impl FeedConnection for HoldOpenConnection {
        async fn send(&mut self, _text: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
            std::future::pending().await
        }
    }

    /// Refuses every connection attempt.
    struct RefusingTransport;

    #[async_trait]
    impl FeedTransport for RefusingTransport {
        async fn connect(&self) -> Result<Box<dyn FeedConnection>, TransportError> {
            Err(TransportError::Closed)
        }
    }

    /// Stalls every send, stretching the unsubscribe drain after cancel.
    struct SlowSendTransport {
        sends_started: Arc<AtomicUsize>,
    }

    struct SlowSendConnection {
        sends_started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedTransport for SlowSendTransport {
        async fn connect(&self) -> Result<Box<dyn FeedConnection>, TransportError> {
            Ok(Box::new(SlowSendConnection {
                sends_started: self.sends_started.clone(),
            }))
        }
    }

    #[async_trait]
    impl FeedConnection for SlowSendConnection {
        async fn send(&mut self, _text: &str) -> Result<(), TransportError> {
            self.sends_started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }

        async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
            std::future::pending().await
        }
    }

    fn make_manager(transport: Arc<dyn FeedTransport>) -> SubscriptionManager {
        SubscriptionManager::new(Arc::new(RecordingSink::new()), transport, test_api_key())
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test]
    async fn test_start_registers_running_feed() {
        let manager = make_manager(Arc::new(HoldOpenTransport));
        let coin = ProductId::from("BTC-USD");

        manager.start(coin.clone()).unwrap();

        let status = manager.status(&coin).unwrap();
        assert_eq!(status.main, TaskState::Running);
        assert_eq!(status.level2, TaskState::Running);
        assert_eq!(manager.list(), vec![coin]);
    }

    #[tokio::test]
    async fn test_double_start_conflicts() {
        let manager = make_manager(Arc::new(HoldOpenTransport));
        let coin = ProductId::from("BTC-USD");

        manager.start(coin.clone()).unwrap();
        let err = manager.start(coin).unwrap_err();
        assert_eq!(err.to_string(), "Already subscribed to BTC-USD");
        assert!(matches!(AppError::from(err), AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_stop_cancels_and_forgets() {
        let manager = make_manager(Arc::new(HoldOpenTransport));
        let coin = ProductId::from("ETH-USD");
        manager.start(coin.clone()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), manager.stop(&coin))
            .await
            .unwrap()
            .unwrap();

        assert!(manager.status(&coin).is_none());
        assert!(manager.list().is_empty());

        let err = manager.stop(&coin).await.unwrap_err();
        assert_eq!(err.to_string(), "Not subscribed to ETH-USD");
        assert!(matches!(AppError::from(err), AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_conflicts_while_previous_feed_drains() {
        let sends_started = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(make_manager(Arc::new(SlowSendTransport {
            sends_started: sends_started.clone(),
        })));
        let coin = ProductId::from("BTC-USD");

        manager.start(coin.clone()).unwrap();
        // Wait until a task is mid-subscribe so cancellation has to drain.
        wait_until(|| sends_started.load(Ordering::SeqCst) >= 1).await;

        let stopper = {
            let manager = manager.clone();
            let coin = coin.clone();
            tokio::spawn(async move { manager.stop(&coin).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = manager.start(coin.clone()).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadySubscribed(_)));
        // The draining feed stays visible to status and list.
        assert!(manager.status(&coin).is_some());
        assert_eq!(manager.list(), vec![coin.clone()]);

        stopper.await.unwrap().unwrap();
        assert!(manager.status(&coin).is_none());

        // Once the drain finishes the instrument can start again.
        manager.start(coin).unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_marks_tasks_failed() {
        let manager = make_manager(Arc::new(RefusingTransport));
        let coin = ProductId::from("BTC-USD");
        manager.start(coin.clone()).unwrap();

        wait_until(|| {
            manager
                .status(&coin)
                .is_some_and(|s| s.main == TaskState::Failed && s.level2 == TaskState::Failed)
        })
        .await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_feed() {
        let manager = make_manager(Arc::new(HoldOpenTransport));
        manager.start(ProductId::from("BTC-USD")).unwrap();
        manager.start(ProductId::from("ETH-USD")).unwrap();
        assert_eq!(manager.list().len(), 2);

        tokio::time::timeout(Duration::from_secs(2), manager.shutdown())
            .await
            .unwrap();
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let manager = make_manager(Arc::new(HoldOpenTransport));
        manager.start(ProductId::from("SOL-USD")).unwrap();
        manager.start(ProductId::from("BTC-USD")).unwrap();
        manager.start(ProductId::from("ETH-USD")).unwrap();

        let listed: Vec<String> = manager
            .list()
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(listed, ["BTC-USD", "ETH-USD", "SOL-USD"]);
    }

    #[test]
    fn test_task_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&TaskState::Failed).unwrap(),
            "\"failed\""
        );
    }
}
