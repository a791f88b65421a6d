//! The application-side receiver of inbound envelopes.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::Envelope;

/// Receives every inbound envelope except `audio` and `interrupt`.
///
/// Calls are serialized: the next envelope is not pulled until the previous
/// `handle` future has completed.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope);
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap `f` as an [`EnvelopeHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) {
        (self.0)(envelope).await;
    }
}

/// Message-passing adapter: envelopes are forwarded to a UI task.
#[async_trait]
impl EnvelopeHandler for mpsc::UnboundedSender<Envelope> {
    async fn handle(&self, envelope: Envelope) {
        if self.send(envelope).is_err() {
            debug!("envelope receiver dropped");
        }
    }
}
