use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::ack::ReceivedMessage;
use crate::config::{SubscriberConfig, SubscriberSettings};
use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::log::StreamLog;
use crate::marshaler::Marshaler;

/// A trait representing a subscriber to topics.
#[async_trait]
pub trait Subscriber
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// Subscribes to `topic`.
    ///
    /// Messages arrive on the returned channel until `cancel` is cancelled or
    /// the subscriber is closed, after which the channel closes.
    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ReceivedMessage>, Error>;

    /// Stops every subscription and waits for them to finish.
    async fn close(&self) -> Result<(), Error>;
}

#[derive(Debug, Default)]
struct SubscriberState {
    closed: bool,
    subscriptions: HashMap<String, CancellationToken>,
}

/// Subscribes to topics through consumer groups on a [`StreamLog`].
///
/// Every topic gets its own coordinator running one read loop.
#[derive(Clone, Debug)]
pub struct StreamSubscriber<L, M>
where
    L: StreamLog,
    M: Marshaler,
{
    log: L,
    marshaler: M,
    settings: Arc<SubscriberSettings>,
    shutdown_token: CancellationToken,
    state: Arc<Mutex<SubscriberState>>,
    task_tracker: TaskTracker,
}

impl<L, M> StreamSubscriber<L, M>
where
    L: StreamLog,
    M: Marshaler,
{
    /// Creates a new subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(log: L, marshaler: M, config: SubscriberConfig) -> Result<Self, Error> {
        let settings = SubscriberSettings::try_from(config)?;

        Ok(Self {
            log,
            marshaler,
            settings: Arc::new(settings),
            shutdown_token: CancellationToken::new(),
            state: Arc::new(Mutex::new(SubscriberState::default())),
            task_tracker: TaskTracker::new(),
        })
    }

    /// The consumer identity of this subscriber.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.settings.consumer
    }

    /// The consumer group of this subscriber.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.settings.consumer_group
    }
}

#[async_trait]
impl<L, M> Subscriber for StreamSubscriber<L, M>
where
    L: StreamLog,
    M: Marshaler,
{
    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ReceivedMessage>, Error> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Err(Error::Closed);
        }

        if state
            .subscriptions
            .get(topic)
            .is_some_and(|token| !token.is_cancelled())
        {
            return Err(Error::AlreadySubscribed(topic.to_string()));
        }

        let subscription_token = self.shutdown_token.child_token();

        let receiver = Coordinator::start(
            self.log.clone(),
            self.marshaler.clone(),
            Arc::clone(&self.settings),
            topic.to_string(),
            subscription_token.clone(),
            cancel,
            &self.task_tracker,
        )
        .await?;

        state
            .subscriptions
            .insert(topic.to_string(), subscription_token);

        Ok(receiver)
    }

    async fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().await;

            if state.closed {
                drop(state);
                self.task_tracker.wait().await;
                return Ok(());
            }

            state.closed = true;
            state.subscriptions.clear();
        }

        debug!(consumer = self.consumer(), "closing subscriber");

        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!(
            consumer = self.consumer(),
            group = self.consumer_group(),
            "subscriber closed"
        );

        Ok(())
    }
}
