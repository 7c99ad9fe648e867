//! Stream interception for `hyper` hosts.
//!
//! [`ChannelInterceptor`] hands the coordinator a [`StreamFilter`] whose writes land in a
//! [`TapBody`], the body the host returns downstream in place of the upstream one.
//! [`pump_body`] drives the upstream body through the coordinator's stream callbacks; chunks the
//! coordinator does not forward itself (no capture unit, or the unit was detached) go straight
//! to the same channel, so the downstream body always sees every byte in order.

use std::{
    collections::HashMap,
    error::Error as StdError,
    fmt,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{
    HeaderMap,
    body::{Body, Frame},
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    coordinator::{CaptureCoordinator, EventOutcome},
    entry::RequestId,
    stream::{ForwardError, InterceptError, StreamFilter, StreamInterceptor},
};

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug)]
enum TapMessage {
    Data(Bytes),
    Trailers(HeaderMap),
    Error(String),
}

#[derive(Debug, thiserror::Error)]
#[error("upstream body failed: {0}")]
pub struct UpstreamError(String);

/// Downstream half of a tapped response.
#[derive(Debug)]
pub struct TapBody {
    rx: mpsc::UnboundedReceiver<TapMessage>,
}

impl Body for TapBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(TapMessage::Data(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(TapMessage::Trailers(trailers))) => {
                Poll::Ready(Some(Ok(Frame::trailers(trailers))))
            }
            Poll::Ready(Some(TapMessage::Error(message))) => {
                Poll::Ready(Some(Err(Box::new(UpstreamError(message)))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sender kept by the pump for chunks the coordinator does not forward.
#[derive(Debug, Clone)]
pub struct Bypass {
    tx: mpsc::UnboundedSender<TapMessage>,
}

impl Bypass {
    fn send(&self, message: TapMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("downstream body dropped");
        }
    }
}

/// Both halves of a tap created by [`ChannelInterceptor`].
#[derive(Debug)]
pub struct Tap {
    pub body: TapBody,
    pub bypass: Bypass,
}

struct ChannelFilter {
    request_id: RequestId,
    tx: Option<mpsc::UnboundedSender<TapMessage>>,
}

impl StreamFilter for ChannelFilter {
    fn write(&mut self, chunk: Bytes) -> Result<(), ForwardError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(ForwardError(format!(
                "filter for request {} already released",
                self.request_id
            )));
        };
        tx.send(TapMessage::Data(chunk))
            .map_err(|_| ForwardError("downstream body dropped".to_owned()))
    }

    fn close(&mut self) {
        self.tx = None;
    }

    fn disconnect(&mut self) {
        if self.tx.take().is_some() {
            tracing::debug!(request_id = %self.request_id, "tap detached; stream passes through");
        }
    }
}

/// Taps are created on demand by the coordinator and must be collected with
/// [`ChannelInterceptor::take_tap`] (or [`tap_response`]) once response headers were handled.
#[derive(Default)]
pub struct ChannelInterceptor {
    taps: Mutex<HashMap<RequestId, Tap>>,
}

impl fmt::Debug for ChannelInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelInterceptor")
            .field("uncollected_taps", &self.lock().len())
            .finish()
    }
}

impl ChannelInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Tap>> {
        self.taps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn take_tap(&self, request_id: &RequestId) -> Option<Tap> {
        self.lock().remove(request_id)
    }
}

impl StreamInterceptor for ChannelInterceptor {
    fn is_available(&self) -> bool {
        true
    }

    fn filter_response_data(
        &self,
        request_id: &RequestId,
    ) -> Result<Box<dyn StreamFilter>, InterceptError> {
        let mut taps = self.lock();
        if taps.contains_key(request_id) {
            return Err(InterceptError::AlreadyIntercepted(request_id.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        taps.insert(
            request_id.clone(),
            Tap {
                body: TapBody { rx },
                bypass: Bypass { tx: tx.clone() },
            },
        );
        Ok(Box::new(ChannelFilter {
            request_id: request_id.clone(),
            tx: Some(tx),
        }))
    }
}

/// Drives `upstream` through the coordinator until it ends, then finalizes the capture.
pub async fn pump_body<B>(
    coordinator: CaptureCoordinator,
    request_id: RequestId,
    mut upstream: B,
    bypass: Bypass,
) -> EventOutcome
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: fmt::Display,
{
    coordinator.stream_started(&request_id);
    while let Some(frame_result) = upstream.frame().await {
        let frame = match frame_result {
            Ok(frame) => frame,
            Err(err) => {
                let message = err.to_string();
                let outcome = coordinator.stream_error(&request_id, &message);
                bypass.send(TapMessage::Error(message));
                return outcome;
            }
        };
        match frame.into_data() {
            Ok(chunk) => {
                if coordinator.stream_data(&request_id, chunk.clone()) == EventOutcome::Ignored {
                    bypass.send(TapMessage::Data(chunk));
                }
            }
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    bypass.send(TapMessage::Trailers(trailers));
                }
            }
        }
    }
    // Downstream ends as soon as both senders are gone; finalization may still wait on policy.
    drop(bypass);
    coordinator.stream_stopped(&request_id).await
}

/// Either the tapped downstream body or the untouched upstream one.
#[derive(Debug)]
pub enum TappedBody<B> {
    Tapped(TapBody),
    Untouched(B),
}

impl<B> Body for TappedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            Self::Tapped(body) => Pin::new(body).poll_frame(cx),
            Self::Untouched(body) => match Pin::new(body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
                Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Call after the coordinator handled the response headers of `request_id`. If a tap was
/// attached, the upstream body is pumped on a spawned task and the tap body is returned.
pub fn tap_response<B>(
    coordinator: &CaptureCoordinator,
    interceptor: &ChannelInterceptor,
    request_id: RequestId,
    upstream: B,
) -> (TappedBody<B>, Option<JoinHandle<EventOutcome>>)
where
    B: Body<Data = Bytes> + Unpin + Send + 'static,
    B::Error: fmt::Display + Send,
{
    let Some(Tap { body, bypass }) = interceptor.take_tap(&request_id) else {
        return (TappedBody::Untouched(upstream), None);
    };
    let pump = tokio::spawn(pump_body(
        coordinator.clone(),
        request_id,
        upstream,
        bypass,
    ));
    (TappedBody::Tapped(body), Some(pump))
}
