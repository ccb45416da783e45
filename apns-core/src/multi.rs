//! Round-robins a fixed pool of independent [`Dispatcher`]s for load
//! spreading across several HTTP/2 connections to APNs.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::MultiDispatcherConfig;
use crate::dispatcher::{BatchResult, Dispatcher};
use crate::error::{ConfigError, DispatchError};
use crate::notification::Notification;

pub struct MultiDispatcher {
    dispatchers: Vec<Dispatcher>,
    next: AtomicUsize,
}

impl MultiDispatcher {
    pub fn new(config: MultiDispatcherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let resolved = config.client_config.resolve()?;

        let mut dispatchers = Vec::with_capacity(config.client_count as usize);
        for _ in 0..config.client_count {
            dispatchers.push(Dispatcher::new(&resolved)?);
        }

        Ok(Self {
            dispatchers,
            next: AtomicUsize::new(0),
        })
    }

    /// Picks the next dispatcher in round-robin order. Advanced once per
    /// call, not once per recipient within the call.
    fn next_dispatcher(&self) -> &Dispatcher {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.dispatchers.len();
        &self.dispatchers[index]
    }

    pub async fn send(&self, notification: &dyn Notification, recipients: &[String]) -> BatchResult {
        self.next_dispatcher().send(notification, recipients).await
    }

    pub async fn manage_channels(
        &self,
        notifications: &[Box<dyn Notification>],
        bundle_id: &str,
        action: &str,
    ) -> Result<BatchResult, DispatchError> {
        self.next_dispatcher()
            .manage_channels(notifications, bundle_id, action)
            .await
    }

    pub async fn broadcast(&self, notifications: &[Box<dyn Notification>], bundle_id: &str) -> BatchResult {
        self.next_dispatcher().broadcast(notifications, bundle_id).await
    }

    /// Shuts down every dispatcher concurrently.
    pub async fn shutdown(&self) {
        futures::future::join_all(self.dispatchers.iter().map(|d| async { d.shutdown() })).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};

    #[test]
    fn round_robin_advances_once_per_call() {
        let counter = StdAtomicUsize::new(0);
        let pick = |len: usize| counter.fetch_add(1, StdOrdering::Relaxed) % len;
        assert_eq!(pick(3), 0);
        assert_eq!(pick(3), 1);
        assert_eq!(pick(3), 2);
        assert_eq!(pick(3), 0);
    }
}
