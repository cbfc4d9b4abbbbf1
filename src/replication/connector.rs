//! Replica Connector
//!
//! Scoped connection lifecycle for one replica: resolve, acquire under a
//! timeout, run a body, release on every exit path.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::{timeout, Instant};

use super::registry::{EndpointRegistry, ReplicaTarget};
use crate::error::{Error, Result};
use crate::store::{Connector, DocumentStore};

/// What happened to one replica's scoped body
#[derive(Debug)]
pub struct Attempt<T> {
    pub result: Result<T>,
    /// Time spent in the body; `None` when no connection was acquired
    pub elapsed: Option<Duration>,
}

impl<T> Attempt<T> {
    fn unmeasured(error: Error) -> Self {
        Self {
            result: Err(error),
            elapsed: None,
        }
    }
}

/// Acquires replica connections and guarantees their release
pub struct ReplicaConnector {
    registry: Arc<EndpointRegistry>,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
}

impl ReplicaConnector {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            connector,
            connect_timeout,
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Run `body` with a connection to `target`
    ///
    /// Never fails as a whole: resolution, acquisition, body errors and body
    /// panics all come back inside the [`Attempt`].
    pub async fn with_connection<T, F, Fut>(&self, target: &ReplicaTarget, body: F) -> Attempt<T>
    where
        F: FnOnce(Arc<dyn DocumentStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(endpoint) = self.registry.resolve(target) else {
            tracing::warn!(target_id = %target, "No endpoint configured for replica");
            return Attempt::unmeasured(Error::EndpointUnresolved(target.to_string()));
        };

        // An acquisition still in flight when the timer fires is dropped, not awaited
        let store = match timeout(self.connect_timeout, self.connector.connect(&endpoint)).await {
            Ok(Ok(store)) => store,
            Ok(Err(e)) => {
                tracing::warn!(target_id = %target, "Connection to {} failed: {}", endpoint.redacted(), e);
                return Attempt::unmeasured(into_connection_error(target, e));
            }
            Err(_) => {
                tracing::warn!(
                    target_id = %target,
                    "Connection to {} timed out after {:?}",
                    endpoint.redacted(),
                    self.connect_timeout
                );
                return Attempt::unmeasured(Error::ConnectionTimeout {
                    target: target.to_string(),
                    timeout_ms: saturating_millis(self.connect_timeout),
                });
            }
        };

        let guard = ConnectionGuard::new(target.clone(), store);
        let handle = guard.handle();

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async move { body(handle).await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        guard.release().await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(target_id = %target, "Replica task panicked: {}", message);
                Err(Error::Internal(format!("replica task panicked: {}", message)))
            }
        };

        Attempt {
            result,
            elapsed: Some(elapsed),
        }
    }
}

/// Owns an acquired connection until it is released
///
/// Dropping an unreleased guard (the surrounding future was cancelled) closes
/// the connection on a background task.
struct ConnectionGuard {
    target: ReplicaTarget,
    store: Arc<dyn DocumentStore>,
    released: bool,
}

impl ConnectionGuard {
    fn new(target: ReplicaTarget, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            target,
            store,
            released: false,
        }
    }

    fn handle(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.store.close().await {
            tracing::warn!(target_id = %self.target, "Error closing connection: {}", e);
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let target = self.target.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = store.close().await {
                    tracing::warn!(target_id = %target, "Error closing abandoned connection: {}", e);
                }
            });
        } else {
            tracing::warn!(target_id = %target, "Connection dropped outside a runtime, not closed");
        }
    }
}

fn into_connection_error(target: &ReplicaTarget, error: Error) -> Error {
    match error {
        Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. } => error,
        other => Error::ConnectionFailed {
            target: target.to_string(),
            reason: other.to_string(),
        },
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
