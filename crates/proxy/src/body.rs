//! Body plumbing shared by the HTTP engine.
//!
//! All request/response bodies flowing through the proxy are erased to
//! [`ProxyBody`]. Streaming is the default; buffering happens only when a
//! transformation needs the full payload, and is always capped.

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::errors::ProxyError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The erased body type used throughout the engine.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// An empty body.
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A fully buffered body.
pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Erase any compatible body.
pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// Collect a body into memory, failing with `PayloadTooLarge` once more
/// than `cap` bytes have been seen. A cap of zero disables the limit.
pub async fn collect_capped<B>(body: B, cap: usize) -> Result<Bytes, ProxyError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let mut body = std::pin::pin!(body);
    let mut collected = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProxyError::UpstreamProtocol(e.into().to_string()))?;
        if let Ok(data) = frame.into_data() {
            if cap > 0 && collected.len() + data.len() > cap {
                return Err(ProxyError::PayloadTooLarge);
            }
            collected.extend_from_slice(&data);
        }
    }

    Ok(collected.freeze())
}

/// Wraps a body, counting data bytes and firing a completion hook exactly
/// once when the stream ends (cleanly or not) or the body is dropped.
///
/// The hook is how per-request observations get their final `bytes_out`
/// and latency: response bodies outlive the handler, so accounting has to
/// ride along with the body itself.
pub struct CountingBody {
    inner: ProxyBody,
    counter: Arc<AtomicU64>,
    on_end: Option<Box<dyn FnOnce(u64) + Send + Sync>>,
}

impl CountingBody {
    pub fn new(inner: ProxyBody) -> (Self, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                counter: counter.clone(),
                on_end: None,
            },
            counter,
        )
    }

    /// Attach a hook receiving the final byte count.
    pub fn with_hook(
        inner: ProxyBody,
        hook: impl FnOnce(u64) + Send + Sync + 'static,
    ) -> Self {
        let (mut body, _) = Self::new(inner);
        body.on_end = Some(Box::new(hook));
        body
    }

    fn finish(&mut self) {
        if let Some(hook) = self.on_end.take() {
            hook(self.counter.load(Ordering::Relaxed));
        }
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Enforces an idle-between-frames deadline on a streaming body.
///
/// The timer resets every time a frame arrives, implementing the
/// "idle between bytes resets the read timer" timeout contract.
pub struct IdleTimeoutBody {
    inner: ProxyBody,
    idle: std::time::Duration,
    sleep: Pin<Box<tokio::time::Sleep>>,
}

impl IdleTimeoutBody {
    pub fn new(inner: ProxyBody, idle: std::time::Duration) -> Self {
        Self {
            inner,
            idle,
            sleep: Box::pin(tokio::time::sleep(idle)),
        }
    }
}

impl Body for IdleTimeoutBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(ready) => {
                this.sleep
                    .as_mut()
                    .reset(tokio::time::Instant::now() + this.idle);
                Poll::Ready(ready)
            }
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Some(Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "body idle timeout",
                ))))),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
