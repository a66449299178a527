//! A single-holder gate guarding token exchanges

use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};

/// Admits one holder at a time
///
/// Entry is either attempted without waiting, or waited for up to a bound.
#[derive(Debug)]
pub struct RefreshGate {
    permits: Semaphore,
}

/// Proof of holding the gate; the gate reopens when this is dropped
#[derive(Debug)]
#[must_use = "the gate is released as soon as the pass is dropped"]
pub struct GatePass<'a> {
    _permit: SemaphorePermit<'a>,
}

impl Default for RefreshGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshGate {
    /// Constructs an open gate
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
        }
    }

    /// Enters the gate if nobody holds it
    pub fn try_enter(&self) -> Option<GatePass<'_>> {
        self.permits
            .try_acquire()
            .ok()
            .map(|permit| GatePass { _permit: permit })
    }

    /// Waits up to `timeout` for the current holder to leave, then enters
    ///
    /// Returns `None` if the wait timed out.
    pub async fn enter_within(&self, timeout: Duration) -> Option<GatePass<'_>> {
        match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => Some(GatePass { _permit: permit }),
            // The semaphore is never closed
            Ok(Err(_)) => None,
            Err(_) => None,
        }
    }

    /// Whether someone currently holds the gate
    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_holder_at_a_time() {
        let gate = RefreshGate::new();

        let pass = gate.try_enter();
        assert!(pass.is_some());
        assert!(gate.is_held());
        assert!(gate.try_enter().is_none());

        drop(pass);
        assert!(!gate.is_held());
        assert!(gate.try_enter().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_gives_up() {
        let gate = RefreshGate::new();
        let _held = gate.try_enter();

        assert!(gate.enter_within(Duration::from_secs(10)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_enters_once_released() {
        let gate = std::sync::Arc::new(RefreshGate::new());

        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _pass = gate.try_enter();
                tokio::time::sleep(Duration::from_secs(3)).await;
            })
        };
        tokio::task::yield_now().await;

        assert!(gate.enter_within(Duration::from_secs(10)).await.is_some());
        holder.await.unwrap();
    }
}
