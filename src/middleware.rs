//! Tower middleware that charges a per-key bucket before calling the inner service.
//!
//! The layer derives a key from each request, lazily creates that key's bucket
//! with the manager's default config, and consumes one request from it. Denied
//! requests never reach the inner service.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;

use crate::bucket::{Data, Decision};
use crate::error::{LimitError, QuotaError};
use crate::manager::BucketManager;
use crate::telemetry::TelemetrySink;

/// A layer that enforces per-key quotas using a [`BucketManager`].
pub struct QuotaLayer<F, S> {
    manager: BucketManager<S>,
    key_fn: Arc<F>,
}

impl<F, S: Clone> Clone for QuotaLayer<F, S> {
    fn clone(&self) -> Self {
        Self { manager: self.manager.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<F, S> QuotaLayer<F, S> {
    /// `key_fn` maps each request to the key whose quota it consumes.
    pub fn new(manager: BucketManager<S>, key_fn: F) -> Self {
        Self { manager, key_fn: Arc::new(key_fn) }
    }
}

impl<Inner, F, S: Clone> Layer<Inner> for QuotaLayer<F, S> {
    type Service = QuotaService<Inner, F, S>;

    fn layer(&self, service: Inner) -> Self::Service {
        QuotaService { inner: service, manager: self.manager.clone(), key_fn: self.key_fn.clone() }
    }
}

/// Middleware service that enforces per-key quotas.
pub struct QuotaService<Inner, F, S> {
    inner: Inner,
    manager: BucketManager<S>,
    key_fn: Arc<F>,
}

impl<Inner: Clone, F, S: Clone> Clone for QuotaService<Inner, F, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            manager: self.manager.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<Inner, F, S, Req> Service<Req> for QuotaService<Inner, F, S>
where
    Inner: Service<Req> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    F: Fn(&Req) -> String + Send + Sync + 'static,
    S: TelemetrySink,
    Req: Send + 'static,
{
    type Response = Inner::Response;
    type Error = LimitError<Inner::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LimitError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        let manager = self.manager.clone();
        // Call the instance poll_ready readied; leave a fresh clone for the next request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match charge(&manager, &key).await {
                Ok(Decision::Allowed(())) => inner.call(req).await.map_err(LimitError::Inner),
                Ok(Decision::Denied { retry_after }) => Err(LimitError::Denied { retry_after }),
                Err(e) => {
                    tracing::warn!(target: "quotabox::middleware", key = %key, error = %e, "quota bucket unavailable");
                    Err(LimitError::Unavailable(e))
                }
            }
        })
    }
}

/// Consume one request for `key`. A bucket that retires between lookup and call
/// is recreated once.
async fn charge<S: TelemetrySink>(
    manager: &BucketManager<S>,
    key: &str,
) -> Result<Decision<()>, QuotaError> {
    match manager.ensure_default(key).put(Data::new()).await {
        Err(e) if e.is_invalid_key() => manager.ensure_default(key).put(Data::new()).await,
        other => other,
    }
}
