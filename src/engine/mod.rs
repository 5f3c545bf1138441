pub mod assignment;
pub mod queue;
pub mod scoring;

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::store::StoreError;

/// Runs one store call under `limit`. An elapsed deadline surfaces as
/// [`AppError::Timeout`]; the call itself is dropped.
pub async fn bounded<T, F>(limit: Duration, op: &str, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::Timeout(format!(
            "store call {op} exceeded {}ms",
            limit.as_millis()
        ))),
    }
}
