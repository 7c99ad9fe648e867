//! Per-request response stream capture.
//!
//! A [`StreamCapture`] sits between the host's stream interception facility and the original
//! consumer. Every chunk is forwarded unchanged before any bookkeeping happens; a bounded copy is
//! kept on the side while the asynchronous policy decision is still outstanding. The two tracks
//! (stream lifecycle and policy resolution) are joined in [`Finalization::resolve`].

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    entry::{EntryId, RequestId},
    matching::FilterReason,
};

pub const BINARY_PLACEHOLDER: &str = "[Binary content not captured]";
pub const UNDECODABLE_PLACEHOLDER: &str = "[Binary data - unable to decode]";

/// Outcome of the asynchronous policy lookup for one request.
pub type PolicyDecision = Result<(), FilterReason>;

#[derive(Debug, thiserror::Error)]
#[error("forward chunk downstream: {0}")]
pub struct ForwardError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("stream interception is not available")]
    Unavailable,
    #[error("response stream of request {0} is already intercepted")]
    AlreadyIntercepted(RequestId),
    #[error("intercept response stream: {0}")]
    Host(String),
}

/// Host handle for one intercepted response stream.
pub trait StreamFilter: Send {
    /// Passes `chunk` to the original consumer unchanged.
    fn write(&mut self, chunk: Bytes) -> Result<(), ForwardError>;

    /// Ends the downstream stream after the last forwarded chunk.
    fn close(&mut self);

    /// Detaches the filter; the rest of the stream reaches the consumer untouched.
    fn disconnect(&mut self);
}

/// Host facility that taps a response stream. Only callable once per request, and only
/// while response headers are being delivered.
pub trait StreamInterceptor: Send + Sync {
    fn is_available(&self) -> bool;

    fn filter_response_data(
        &self,
        request_id: &RequestId,
    ) -> Result<Box<dyn StreamFilter>, InterceptError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Uninitialized,
    Streaming,
    Finalizing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Close,
    Disconnect,
}

enum DecisionTrack {
    Pending(oneshot::Receiver<PolicyDecision>),
    Resolved(PolicyDecision),
}

impl DecisionTrack {
    fn poll_now(&mut self) -> Option<&PolicyDecision> {
        if let Self::Pending(rx) = self {
            match rx.try_recv() {
                Ok(decision) => *self = Self::Resolved(decision),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    *self = Self::Resolved(Err(FilterReason::PolicyUnavailable));
                }
            }
        }
        match self {
            Self::Resolved(decision) => Some(decision),
            Self::Pending(_) => None,
        }
    }
}

/// Captured body after decoding and truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedBody {
    pub body: String,
    /// Every byte observed on the stream, retained or not.
    pub body_size: u64,
    pub truncated: bool,
}

impl FinalizedBody {
    pub fn binary_placeholder() -> Self {
        Self {
            body: BINARY_PLACEHOLDER.to_owned(),
            body_size: 0,
            truncated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Captured(FinalizedBody),
    Denied { reason: FilterReason, body_size: u64 },
}

pub struct StreamCapture {
    request_id: RequestId,
    entry_id: EntryId,
    filter: Box<dyn StreamFilter>,
    state: CaptureState,
    released: bool,
    decision: Option<DecisionTrack>,
    policy_wait: Duration,
    max_body_size: usize,
    chunks: Vec<Bytes>,
    buffered_len: usize,
    total_len: u64,
    truncated: bool,
    buffering: bool,
}

impl std::fmt::Debug for StreamCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCapture")
            .field("request_id", &self.request_id)
            .field("entry_id", &self.entry_id)
            .field("state", &self.state)
            .field("buffered_len", &self.buffered_len)
            .field("total_len", &self.total_len)
            .field("truncated", &self.truncated)
            .finish_non_exhaustive()
    }
}

impl StreamCapture {
    /// `decision` is the asynchronous policy track; `None` means capture is already decided
    /// as allowed.
    pub fn new(
        request_id: RequestId,
        entry_id: EntryId,
        filter: Box<dyn StreamFilter>,
        max_body_size: usize,
        decision: Option<oneshot::Receiver<PolicyDecision>>,
        policy_wait: Duration,
    ) -> Self {
        Self {
            request_id,
            entry_id,
            filter,
            state: CaptureState::Uninitialized,
            released: false,
            decision: decision.map(DecisionTrack::Pending),
            policy_wait,
            max_body_size: max_body_size.max(1),
            chunks: Vec::new(),
            buffered_len: 0,
            total_len: 0,
            truncated: false,
            buffering: true,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn entry_id(&self) -> &EntryId {
        &self.entry_id
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered_len
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn on_start(&mut self) {
        if self.state == CaptureState::Uninitialized {
            self.state = CaptureState::Streaming;
            tracing::debug!(request_id = %self.request_id, "response stream started");
        }
    }

    /// Forwards `chunk` downstream, then keeps a copy if capture is still wanted and the
    /// size cap has not been hit.
    pub fn on_data(&mut self, chunk: Bytes) {
        if self.released {
            tracing::warn!(
                request_id = %self.request_id,
                state = ?self.state,
                "chunk arrived after the filter was released"
            );
            return;
        }
        if let Err(err) = self.filter.write(chunk.clone()) {
            tracing::warn!(request_id = %self.request_id, "{err}");
        }
        self.on_start();

        let chunk_len = chunk.len();
        self.total_len = self
            .total_len
            .saturating_add(u64::try_from(chunk_len).unwrap_or(u64::MAX));

        if self.buffering
            && let Some(Err(reason)) = self.decision.as_mut().and_then(DecisionTrack::poll_now)
        {
            tracing::debug!(
                request_id = %self.request_id,
                %reason,
                "capture denied while streaming; dropping buffered copy"
            );
            self.buffering = false;
            self.chunks = Vec::new();
            self.buffered_len = 0;
        }
        if !self.buffering || self.truncated {
            return;
        }
        if self.buffered_len.saturating_add(chunk_len) > self.max_body_size {
            self.truncated = true;
            tracing::debug!(
                request_id = %self.request_id,
                max_body_size = self.max_body_size,
                "response exceeds max body size; truncating"
            );
            return;
        }
        self.buffered_len += chunk_len;
        self.chunks.push(chunk);
    }

    /// Stream completed: releases the filter and hands the buffered copy to finalization.
    pub fn finish(mut self) -> Finalization {
        self.state = CaptureState::Finalizing;
        self.release(Release::Close);
        let finalization = Finalization {
            request_id: self.request_id.clone(),
            entry_id: self.entry_id.clone(),
            chunks: std::mem::take(&mut self.chunks),
            buffered_len: self.buffered_len,
            total_len: self.total_len,
            truncated: self.truncated,
            max_body_size: self.max_body_size,
            decision: self.decision.take(),
            policy_wait: self.policy_wait,
        };
        self.state = CaptureState::Closed;
        finalization
    }

    /// Stream failed: releases the filter and drops everything buffered.
    pub fn fail(mut self, error: &str) {
        tracing::debug!(
            request_id = %self.request_id,
            chunks_received = self.chunks.len(),
            "response stream failed: {error}"
        );
        self.state = CaptureState::Failed;
        self.release(Release::Close);
    }

    /// Owning context went away: let the stream continue untapped and drop the copy.
    pub fn abort(mut self) {
        self.chunks = Vec::new();
        self.release(Release::Disconnect);
        self.state = CaptureState::Closed;
    }

    /// Non-text content: nothing is buffered and the entry completes with a placeholder.
    pub fn skip(mut self) -> FinalizedBody {
        self.release(Release::Disconnect);
        self.state = CaptureState::Closed;
        FinalizedBody::binary_placeholder()
    }

    fn release(&mut self, how: Release) {
        if self.released {
            tracing::warn!(
                request_id = %self.request_id,
                attempted = ?how,
                "stream filter already released"
            );
            return;
        }
        self.released = true;
        match how {
            Release::Close => self.filter.close(),
            Release::Disconnect => self.filter.disconnect(),
        }
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        if !self.released {
            self.release(Release::Disconnect);
        }
    }
}

/// Buffered stream contents waiting for the policy decision.
#[derive(Debug)]
pub struct Finalization {
    request_id: RequestId,
    entry_id: EntryId,
    chunks: Vec<Bytes>,
    buffered_len: usize,
    total_len: u64,
    truncated: bool,
    max_body_size: usize,
    decision: Option<DecisionTrack>,
    policy_wait: Duration,
}

impl std::fmt::Debug for DecisionTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("Pending"),
            Self::Resolved(decision) => f.debug_tuple("Resolved").field(decision).finish(),
        }
    }
}

impl Finalization {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn entry_id(&self) -> &EntryId {
        &self.entry_id
    }

    /// Waits at most the configured policy wait for the decision; an unresolved or failed
    /// lookup denies capture.
    pub async fn resolve(self) -> FinalizeOutcome {
        let decision = match self.decision {
            None => Ok(()),
            Some(DecisionTrack::Resolved(decision)) => decision,
            Some(DecisionTrack::Pending(rx)) => {
                match tokio::time::timeout(self.policy_wait, rx).await {
                    Ok(Ok(decision)) => decision,
                    Ok(Err(_)) => Err(FilterReason::PolicyUnavailable),
                    Err(_) => {
                        tracing::debug!(
                            request_id = %self.request_id,
                            wait_ms = u64::try_from(self.policy_wait.as_millis()).unwrap_or(u64::MAX),
                            "policy decision still pending at stream end"
                        );
                        Err(FilterReason::PolicyUnavailable)
                    }
                }
            }
        };

        match decision {
            Ok(()) => FinalizeOutcome::Captured(decode_body(
                self.chunks,
                self.buffered_len,
                self.total_len,
                self.truncated,
                self.max_body_size,
            )),
            Err(reason) => FinalizeOutcome::Denied {
                reason,
                body_size: self.total_len,
            },
        }
    }
}

/// Joins, decodes and truncates a buffered body.
pub fn decode_body(
    chunks: Vec<Bytes>,
    buffered_len: usize,
    total_len: u64,
    truncated: bool,
    max_body_size: usize,
) -> FinalizedBody {
    let bytes = flatten_chunks(chunks, buffered_len);
    let Some(mut body) = decode_utf8(&bytes, truncated) else {
        return FinalizedBody {
            body: UNDECODABLE_PLACEHOLDER.to_owned(),
            body_size: total_len,
            truncated,
        };
    };

    let mut truncated = truncated;
    if let Some((cut_at, _)) = body.char_indices().nth(max_body_size) {
        let dropped = body[cut_at..].chars().count();
        body.truncate(cut_at);
        body.push_str(&format!("\n\n[... truncated {dropped} characters]"));
        truncated = true;
    } else if truncated {
        let dropped =
            total_len.saturating_sub(u64::try_from(bytes.len()).unwrap_or(u64::MAX));
        body.push_str(&format!("\n\n[... truncated {dropped} bytes]"));
    }

    FinalizedBody {
        body,
        body_size: total_len,
        truncated,
    }
}

fn flatten_chunks(mut buffered: Vec<Bytes>, buffered_len: usize) -> Bytes {
    if buffered.len() <= 1 {
        return buffered.pop().unwrap_or_default();
    }

    let mut flattened = Vec::with_capacity(buffered_len);
    for chunk in buffered {
        flattened.extend_from_slice(&chunk);
    }
    Bytes::from(flattened)
}

/// Strict UTF-8. A cut-off multi-byte sequence at the very end is dropped when the body was
/// truncated, since the cut fell at a chunk boundary.
fn decode_utf8(bytes: &[u8], allow_incomplete_tail: bool) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(text.to_owned()),
        Err(err) if allow_incomplete_tail && err.error_len().is_none() => {
            std::str::from_utf8(&bytes[..err.valid_up_to()])
                .ok()
                .map(str::to_owned)
        }
        Err(_) => None,
    }
}
