//! Authenticated user stream built on a [`StreamConnection`].
//!
//! `UserStreamSession` logs in, subscribes to execution reports and forwards
//! every `report` payload to its handle. When the underlying sequence ends
//! it waits `resubscribe_delay` and sets the subscriptions up again on a
//! fresh connection. This is caller-level policy: the stream core itself
//! never reconnects on its own.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::retry::{retry_async, RetryPolicy};
use crate::stream::client::{StreamClientError, StreamConnection, Subscription};
use crate::stream::proto::Credentials;

/// Method carrying order execution reports.
pub const REPORT_METHOD: &str = "report";
/// Method that enables execution reports for the logged-in account.
pub const SUBSCRIBE_REPORTS_METHOD: &str = "subscribeReports";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UserStreamDefaults;

impl UserStreamDefaults {
    pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct UserStreamSession {
    connection: StreamConnection,
    credentials: Credentials,
    retry_policy: RetryPolicy,
    resubscribe_delay: Duration,
}

impl UserStreamSession {
    pub fn new(connection: StreamConnection, credentials: Credentials) -> Self {
        Self {
            connection,
            credentials,
            retry_policy: RetryPolicy::stream_setup(),
            resubscribe_delay: UserStreamDefaults::RESUBSCRIBE_DELAY,
        }
    }

    /// Retry policy for the login/subscribe setup of each round.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Pause between the end of one round and the next setup.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Runs the session on a background task.
    pub fn spawn(self) -> UserStreamHandle {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let last_recv = Arc::new(RwLock::new(None));
        let task = tokio::spawn(self.run(report_tx, Arc::clone(&last_recv)));
        UserStreamHandle {
            reports: report_rx,
            last_recv,
            task,
        }
    }

    async fn run(
        self,
        reports: mpsc::UnboundedSender<Value>,
        last_recv: Arc<RwLock<Option<Instant>>>,
    ) {
        loop {
            match self.open_reports().await {
                Ok(mut subscription) => {
                    while let Some(report) = subscription.next().await {
                        if let Ok(mut guard) = last_recv.write() {
                            *guard = Some(Instant::now());
                        }
                        if reports.send(report).is_err() {
                            return;
                        }
                    }
                    warn!(
                        event = "user_stream_ended",
                        delay_ms = self.resubscribe_delay.as_millis() as u64,
                        "user stream ended, resubscribing"
                    );
                }
                Err(err) => {
                    error!(
                        event = "user_stream_setup_failed",
                        error = %err,
                        delay_ms = self.resubscribe_delay.as_millis() as u64,
                        "unexpected error with user stream connection, retrying"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
                _ = reports.closed() => return,
            }
        }
    }

    async fn open_reports(&self) -> Result<Subscription, StreamClientError> {
        retry_async(
            &self.retry_policy,
            |_| self.subscribe_reports(),
            StreamClientError::is_connect_failure,
        )
        .await
    }

    /// Listens before subscribing so that no report sent in response to the
    /// subscription is discarded.
    async fn subscribe_reports(&self) -> Result<Subscription, StreamClientError> {
        let subscription = self.connection.listen(REPORT_METHOD).await;
        if subscription.connection().is_none() {
            return Err(StreamClientError::NotConnected);
        }
        self.connection.login(&self.credentials).await?;
        self.connection
            .subscribe(SUBSCRIBE_REPORTS_METHOD, json!({}))
            .await?;
        Ok(subscription)
    }
}

/// Receiving side of a running [`UserStreamSession`].
///
/// Dropping the handle stops the session task.
#[derive(Debug)]
pub struct UserStreamHandle {
    reports: mpsc::UnboundedReceiver<Value>,
    last_recv: Arc<RwLock<Option<Instant>>>,
    task: JoinHandle<()>,
}

impl UserStreamHandle {
    /// Next execution report payload; `None` once the session task is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.reports.recv().await
    }

    /// Time the last report was received, if any.
    pub fn last_recv_time(&self) -> Option<Instant> {
        self.last_recv.read().ok().and_then(|guard| *guard)
    }
}

impl Drop for UserStreamHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
