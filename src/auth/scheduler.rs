//! Background refresh ahead of expiry.
//!
//! The task sleeps until the account enters its refresh window and then
//! goes through [`TokenManager::get_access_token`], so it shares the
//! manager's lock and never races a caller-driven refresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::manager::TokenManager;

pub struct RefreshScheduler {
    manager: Arc<TokenManager>,
    idle_interval: Duration,
    retry_interval: Duration,
}

impl RefreshScheduler {
    pub fn new(manager: Arc<TokenManager>) -> Self {
        Self {
            manager,
            idle_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(30),
        }
    }

    /// Longest sleep between checks. Also the poll rate while the account
    /// is unauthenticated.
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Pause after each refresh attempt before re-checking.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle {
            handle: Some(handle),
            shutdown: Some(shutdown_tx),
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!(
            "Refresh scheduler started for {}",
            self.manager.account()
        );

        loop {
            let wait = match self.manager.refresh_due_in().await {
                None => self.idle_interval,
                Some(due) if !due.is_zero() => due.min(self.idle_interval),
                Some(_) => {
                    self.refresh_now().await;
                    self.retry_interval
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!(
            "Refresh scheduler stopped for {}",
            self.manager.account()
        );
    }

    async fn refresh_now(&self) {
        let account = self.manager.account();
        match self.manager.get_access_token().await {
            Ok(_) => tracing::debug!("Background refresh check done for {}", account),
            Err(e) if e.requires_reauth() => {
                tracing::warn!("Background refresh for {} needs re-authentication: {}", account, e)
            }
            Err(e) => tracing::warn!("Background refresh for {} failed: {}", account, e),
        }
    }
}

/// Owner of a running scheduler task. Dropping it aborts the task.
pub struct SchedulerHandle {
    handle: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl SchedulerHandle {
    /// Signal the task and wait for it to finish. An in-flight refresh
    /// completes first.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(h) = self.handle.take() {
            let _ = h.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::manager::tests::{credentials, t0, MockEndpoint};
    use crate::auth::manager::ManagerSettings;
    use crate::auth::store::MemoryTokenStore;
    use std::sync::atomic::Ordering;

    fn manager(endpoint: Arc<MockEndpoint>, clock: Arc<ManualClock>) -> Arc<TokenManager> {
        Arc::new(
            TokenManager::open_with_clock(
                "acct",
                ManagerSettings::new(credentials()),
                endpoint,
                Arc::new(MemoryTokenStore::new()),
                clock,
            )
            .unwrap(),
        )
    }

    fn fast(manager: Arc<TokenManager>) -> SchedulerHandle {
        RefreshScheduler::new(manager)
            .idle_interval(Duration::from_millis(10))
            .retry_interval(Duration::from_millis(10))
            .spawn()
    }

    #[tokio::test]
    async fn test_refreshes_once_inside_window() {
        let endpoint = Arc::new(MockEndpoint::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let manager = manager(endpoint.clone(), clock.clone());
        manager.authenticate("code").await.unwrap();

        let handle = fast(manager.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 0);

        clock.advance(chrono::Duration::seconds(3400));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_token_info().await.refresh_count, 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_unauthenticated_account_is_left_alone() {
        let endpoint = Arc::new(MockEndpoint::new());
        let manager = manager(endpoint.clone(), Arc::new(ManualClock::new(t0())));

        let handle = fast(manager);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(!handle.is_finished());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_long_sleep() {
        let endpoint = Arc::new(MockEndpoint::new());
        let manager = manager(endpoint, Arc::new(ManualClock::new(t0())));

        let handle = RefreshScheduler::new(manager).spawn();
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap();
    }
}
