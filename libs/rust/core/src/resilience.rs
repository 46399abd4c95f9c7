//! Retry with bounded exponential backoff and jitter.

use std::time::Duration;

use rand::{thread_rng, Rng};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2_000),
            jitter: 0.25,
        }
    }
}

/// Runs `op` up to `cfg.max_attempts` times. An error is retried only while
/// `retryable` says so; the final (or first non-retryable) error is returned
/// as-is.
pub async fn retry_async<F, Fut, T, E, P>(cfg: &RetryConfig, mut retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 >= cfg.max_attempts || !retryable(&e) => return Err(e),
            Err(_) => {
                let exp = cfg.base_delay.mul_f64(2f64.powi(attempt as i32));
                let mut delay = std::cmp::min(exp, cfg.max_delay);
                if cfg.jitter > 0.0 {
                    let jitter_ms = (delay.as_millis() as f64 * cfg.jitter) as u64;
                    if jitter_ms > 0 {
                        let offset: i64 = thread_rng().gen_range(-(jitter_ms as i64)..=(jitter_ms as i64));
                        let base_ms = delay.as_millis() as i64 + offset;
                        delay = Duration::from_millis(base_ms.max(0) as u64);
                    }
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn eventual_success() {
        let mut attempts = 0;
        let res: Result<u32, &str> = retry_async(&fast_cfg(5), |_| true, |_| {
            attempts += 1;
            async move { if attempts < 3 { Err("fail") } else { Ok(42) } }
        })
        .await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let mut attempts = 0;
        let res: Result<u32, &str> = retry_async(&fast_cfg(5), |e: &&str| *e == "soft", |_| {
            attempts += 1;
            async { Err("hard") }
        })
        .await;
        assert_eq!(res.unwrap_err(), "hard");
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let mut attempts = 0;
        let res: Result<u32, &str> = retry_async(&fast_cfg(3), |_| true, |_| {
            attempts += 1;
            async { Err("fail") }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(attempts, 3);
    }
}
