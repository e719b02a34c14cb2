//! Process-wide ALIVE -> DEAD status flag.

use std::sync::Arc;

use tokio::sync::watch;

/// Status of a running node.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ServerStatus {
    Alive,
    Dead,
}

/// Shared status flag, cheap to clone into every task of a node. The only
/// transition is ALIVE -> DEAD, after which every accept loop, handler loop
/// and supervised worker watching it exits.
#[derive(Debug, Clone)]
pub struct StatusFlag {
    tx_status: Arc<watch::Sender<ServerStatus>>,
}

impl StatusFlag {
    /// Creates a new flag in the ALIVE state.
    pub fn new() -> Self {
        let (tx_status, _) = watch::channel(ServerStatus::Alive);
        StatusFlag {
            tx_status: Arc::new(tx_status),
        }
    }

    /// Current status.
    pub fn get(&self) -> ServerStatus {
        *self.tx_status.borrow()
    }

    pub fn is_dead(&self) -> bool {
        self.get() == ServerStatus::Dead
    }

    /// Marks the node DEAD. Terminal; marking twice is a no-op.
    pub fn mark_dead(&self) {
        self.tx_status.send_if_modified(|status| {
            if *status == ServerStatus::Dead {
                false
            } else {
                *status = ServerStatus::Dead;
                true
            }
        });
    }

    /// Resolves once the node has been marked DEAD. Typically used as a
    /// branch of a `tokio::select!`.
    pub async fn wait_dead(&self) {
        let mut rx_status = self.tx_status.subscribe();
        // the sender lives as long as `self`, so `changed()` cannot fail here
        while *rx_status.borrow_and_update() != ServerStatus::Dead {
            if rx_status.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for StatusFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod status_tests {
    use super::*;
    use tokio::time::{self, Duration};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn alive_to_dead() {
        let status = StatusFlag::new();
        assert_eq!(status.get(), ServerStatus::Alive);
        let waiter = {
            let status = status.clone();
            tokio::spawn(async move { status.wait_dead().await })
        };
        time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        status.mark_dead();
        status.mark_dead();
        time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .expect("waiter panicked");
        assert!(status.is_dead());
        // already dead resolves immediately
        time::timeout(Duration::from_millis(100), status.wait_dead())
            .await
            .expect("wait_dead on dead flag blocked");
    }
}
