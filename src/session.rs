//! Per-invocation context and the shutdown signal

use crate::errors::ImageError;
use std::{fmt, future::Future};
use tokio::sync::watch;

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "default";

/// Context for one invocation of the pipeline
///
/// Every suspension point that might take a while selects on the shutdown
/// signal carried here. Sessions are cheap to clone and never persisted.
#[derive(Clone)]
pub struct Session {
    id: String,
    namespace: String,
    shutdown: watch::Receiver<bool>,
}

/// The sending side of a shutdown signal
///
/// Triggering is sticky: every session created from this trigger, before or
/// after the call, sees the shutdown.
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        ShutdownTrigger { sender }
    }

    /// Create a session which observes this trigger
    pub fn session(&self, namespace: &str) -> Session {
        Session::with_receiver(namespace, self.sender.subscribe())
    }

    /// Request shutdown, returns true on the first call only
    pub fn trigger(&self) -> bool {
        let previous = self.sender.send_replace(true);
        if !previous {
            log::info!("shutdown requested");
        }
        !previous
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        ShutdownTrigger::new()
    }
}

impl Session {
    /// A session with no way to trigger shutdown
    pub fn new(namespace: &str) -> Self {
        let (_, receiver) = watch::channel(false);
        Session::with_receiver(namespace, receiver)
    }

    fn with_receiver(namespace: &str, shutdown: watch::Receiver<bool>) -> Self {
        Session {
            id: format!("{:016x}", rand::random::<u64>()),
            namespace: namespace.to_owned(),
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown has been requested
    ///
    /// If the trigger is gone without ever firing, this never resolves.
    pub async fn shutdown_requested(&self) {
        let mut receiver = self.shutdown.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run a future to completion unless shutdown is requested first
    ///
    /// Returns `None` on shutdown. The future is dropped at that point.
    pub async fn until_shutdown<F: Future>(&self, future: F) -> Option<F::Output> {
        if self.is_shutdown() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown_requested() => None,
            output = future => Some(output),
        }
    }

    /// Like [Session::until_shutdown], for fallible image operations
    pub async fn interruptible<T, F>(&self, future: F) -> Result<T, ImageError>
    where
        F: Future<Output = Result<T, ImageError>>,
    {
        match self.until_shutdown(future).await {
            Some(result) => result,
            None => Err(ImageError::Interrupted),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn detached_session_runs_to_completion() {
        let session = Session::new(DEFAULT_NAMESPACE);
        assert_eq!(session.namespace(), "default");
        assert_eq!(session.until_shutdown(async { 5 }).await, Some(5));
        assert!(!session.is_shutdown());
    }

    #[tokio::test]
    async fn trigger_interrupts_pending_work() {
        let trigger = ShutdownTrigger::new();
        let session = trigger.session("test");
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .interruptible(async {
                        tokio::time::sleep(Duration::from_secs(600)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(trigger.trigger());
        assert!(!trigger.trigger());
        assert!(matches!(waiter.await.unwrap(), Err(ImageError::Interrupted)));
        assert!(session.is_shutdown());
    }

    #[tokio::test]
    async fn sessions_created_after_trigger_see_it() {
        let trigger = ShutdownTrigger::new();
        trigger.trigger();
        let session = trigger.session("late");
        assert!(session.is_shutdown());
        assert_eq!(session.until_shutdown(async { 1 }).await, None);
    }

    #[test]
    fn session_ids_differ() {
        assert_ne!(Session::new("a").id(), Session::new("a").id());
    }
}
