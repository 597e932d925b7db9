use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use strata_common::{GenerationError, VoxelChunk};
use tokio::sync::oneshot;

pub type GenerationResult = Result<Arc<VoxelChunk>, GenerationError>;

/// Sending half kept by the processor for each outstanding request.
pub(crate) type Waiter = oneshot::Sender<GenerationResult>;

/// Write-once result of one `process_chunk` call.
///
/// Resolves to [`GenerationError::Cancelled`] if the processor drops the
/// request, which is what happens to every outstanding request on stop.
#[derive(Debug)]
pub struct ResultHandle {
    rx: oneshot::Receiver<GenerationResult>,
}

impl ResultHandle {
    pub(crate) fn channel() -> (Waiter, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Already resolved handle.
    pub fn ready(result: GenerationResult) -> Self {
        let (tx, handle) = Self::channel();
        let _ = tx.send(result);
        handle
    }
}

impl Future for ResultHandle {
    type Output = GenerationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(GenerationError::Cancelled)))
    }
}
