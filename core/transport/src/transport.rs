//! Transport trait definition.

use async_trait::async_trait;
use std::sync::Arc;

use tether_common::{ApiRequest, ApiResponse, Result};

/// A single-shot HTTP primitive.
///
/// Implementations send exactly one request and return whatever the remote
/// side answered. They do not retry and do not enforce deadlines; callers
/// cancel an in-flight call by dropping the returned future.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request` once.
    ///
    /// # Errors
    /// - `Error::Network` when no response could be obtained
    /// - `Error::InvalidInput` when the URL cannot be resolved
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        (**self).send(request).await
    }
}
