pub mod initialize;
pub mod measure_insulation;
pub mod set_channel_state;

use std::time::Duration;
use tokio::time::Instant;

/// Polls `condition` every `every` until it holds or `timeout` passes.
/// The condition is checked once more at the deadline.
pub async fn wait_until<F>(timeout: Duration, every: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;

    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(every.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn immediate() {
        assert!(wait_until(Duration::ZERO, Duration::from_millis(1), || true).await);
    }

    #[tokio::test]
    async fn eventually() {
        let calls = AtomicUsize::new(0);
        let ok = wait_until(Duration::from_secs(1), Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;

        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn times_out() {
        let started = Instant::now();
        assert!(!wait_until(Duration::from_millis(30), Duration::from_millis(5), || false).await);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
