//! Small synchronization helpers shared by flows and the flow registry.

use tokio::sync::watch;

/// Counter that tasks can wait on until it drops to zero.
///
/// `add`/`done` are synchronous so they can be called from blocking
/// processor threads and under registry locks; `wait` is async.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    tx: watch::Sender<usize>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    /// Create a group with a zero counter.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Increment the counter by `n`.
    pub fn add(&self, n: usize) {
        self.tx.send_modify(|c| *c += n);
    }

    /// Decrement the counter by one.
    ///
    /// Extra calls saturate at zero rather than wrapping.
    pub fn done(&self) {
        self.tx.send_modify(|c| *c = c.saturating_sub(1));
    }

    /// Current counter value.
    pub fn count(&self) -> usize {
        *self.tx.borrow()
    }

    /// Resolve once the counter reaches zero.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_last_done() {
        let wg = WaitGroup::new();
        wg.add(2);
        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };
        wg.done();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        wg.done();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("wait returns")
            .expect("join");
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn wait_on_empty_group_returns_immediately() {
        let wg = WaitGroup::new();
        tokio::time::timeout(Duration::from_secs(1), wg.wait())
            .await
            .expect("no waiting");
    }
}
