//! One retry with jittered backoff for transport failures.

use std::future::Future;
use std::time::Duration;

use kpt_core::{CancellationToken, Error, Result};
use metrics::counter;
use rand::Rng;
use tracing::warn;

fn jittered(backoff: Duration) -> Duration {
    let half = (backoff.as_millis() as u64) / 2;
    let extra = if half == 0 { 0 } else { rand::thread_rng().gen_range(0..=half) };
    backoff + Duration::from_millis(extra)
}

/// Runs `f`; a `TransportError` is retried once after `backoff` plus up to
/// half of it again. Other errors return immediately.
pub async fn retry_transport<T, F, Fut>(op: &str, backoff: Duration, cancel: &CancellationToken, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Err(e) if e.is_retryable() => {
            let wait = jittered(backoff);
            warn!(op, wait_ms = wait.as_millis() as u64, error = %e, "transport error; retrying once");
            counter!("kpt_fetch_retries_total", 1u64);
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::internal("cancelled").with_op(op)),
                _ = tokio::time::sleep(wait) => f().await,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn transport_errors_retry_once() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let res: Result<()> = retry_transport("t", Duration::from_millis(1), &token, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::transport("reset"))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_do_not_retry() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let res: Result<u8> = retry_transport("t", Duration::from_millis(1), &token, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::not_found("ref"))
            } else {
                Ok(1)
            }
        })
        .await;
        assert!(res.unwrap_err().is(kpt_core::ErrorKind::NotFound));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jitter_stays_within_half() {
        for _ in 0..50 {
            let d = jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }
}
