// Exchange gateway: the only suspension points in the engine
pub mod binance;
pub mod paper;

pub use binance::BinanceFutures;
pub use paper::PaperExchange;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ExchangeError;
use crate::models::{Order, OrderRef, OrderRequest};

/// Synchronous-looking surface over the exchange. Every call may fail or
/// time out; callers treat a placement timeout as "unknown outcome" and
/// follow up with a status query before compensating.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderRef, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError>;

    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<Order, ExchangeError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<Order>, ExchangeError>;

    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError>;
}

pub type SharedGateway = Arc<dyn ExchangeGateway>;

const MAX_READ_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 250;

/// Retry an idempotent read (status/price query) with exponential backoff.
///
/// Only transient failures are retried; placements and cancels must never
/// go through this path since they may have partially succeeded remotely.
pub async fn retry_read<T, F, Fut>(op: F) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < MAX_READ_ATTEMPTS => {
                attempt += 1;
                let backoff = Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt - 1));
                tracing::warn!("transient exchange error ({}), retry {} in {:?}", e, attempt, backoff);
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_read_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = retry_read(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::RateLimited)
                } else {
                    Ok(42u64)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_read_gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<u64, _> = retry_read(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Timeout) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_READ_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retry_read_does_not_retry_permanent_failures() {
        let calls = AtomicU32::new(0);

        let result: Result<u64, _> = retry_read(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::OrderNotFound(7)) }
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::OrderNotFound(7))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
