//! JSON-lines trace of host events, replayed through a coordinator by the CLI.
//!
//! One event per line, tagged by `event`. Blank lines and lines starting with `#` are skipped.

use std::{
    collections::BTreeMap,
    io::BufRead,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    coordinator::{CaptureCoordinator, EventOutcome, LifecycleEvent, StreamEvent},
    entry::{ContextId, Headers, RequestId},
    stream::{ForwardError, InterceptError, StreamFilter, StreamInterceptor},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    RequestObserved {
        request_id: String,
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        resource_type: Option<String>,
        #[serde(default)]
        context_id: Option<i64>,
        #[serde(default)]
        request_body: Option<String>,
    },
    RequestHeaders {
        request_id: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    ResponseHeaders {
        request_id: String,
        status: u16,
        #[serde(default)]
        status_text: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    StreamStart {
        request_id: String,
    },
    /// Chunk given as UTF-8 `text` or as raw `bytes`.
    StreamData {
        request_id: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        bytes: Option<Vec<u8>>,
    },
    StreamStop {
        request_id: String,
    },
    StreamError {
        request_id: String,
        error: String,
    },
    RequestCompleted {
        request_id: String,
    },
    RequestFailed {
        request_id: String,
        error: String,
    },
    ContextDestroyed {
        context_id: i64,
    },
}

fn default_method() -> String {
    "GET".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceStep {
    Lifecycle(LifecycleEvent),
    Stream(StreamEvent),
}

impl From<TraceEvent> for TraceStep {
    fn from(event: TraceEvent) -> Self {
        match event {
            TraceEvent::RequestObserved {
                request_id,
                url,
                method,
                resource_type,
                context_id,
                request_body,
            } => Self::Lifecycle(LifecycleEvent::RequestObserved {
                request_id: RequestId::new(request_id),
                url,
                method,
                resource_type,
                context_id: context_id.map(ContextId),
                request_body,
            }),
            TraceEvent::RequestHeaders {
                request_id,
                headers,
            } => Self::Lifecycle(LifecycleEvent::RequestHeaders {
                request_id: RequestId::new(request_id),
                headers: Headers::from_pairs(headers),
            }),
            TraceEvent::ResponseHeaders {
                request_id,
                status,
                status_text,
                headers,
            } => Self::Lifecycle(LifecycleEvent::ResponseHeaders {
                request_id: RequestId::new(request_id),
                status,
                status_text,
                headers: Headers::from_pairs(headers),
            }),
            TraceEvent::StreamStart { request_id } => Self::Stream(StreamEvent::Start {
                request_id: RequestId::new(request_id),
            }),
            TraceEvent::StreamData {
                request_id,
                text,
                bytes,
            } => {
                let mut chunk = text.map(String::into_bytes).unwrap_or_default();
                chunk.extend(bytes.unwrap_or_default());
                Self::Stream(StreamEvent::Data {
                    request_id: RequestId::new(request_id),
                    chunk: Bytes::from(chunk),
                })
            }
            TraceEvent::StreamStop { request_id } => Self::Stream(StreamEvent::Stop {
                request_id: RequestId::new(request_id),
            }),
            TraceEvent::StreamError { request_id, error } => Self::Stream(StreamEvent::Error {
                request_id: RequestId::new(request_id),
                error,
            }),
            TraceEvent::RequestCompleted { request_id } => {
                Self::Lifecycle(LifecycleEvent::RequestCompleted {
                    request_id: RequestId::new(request_id),
                })
            }
            TraceEvent::RequestFailed { request_id, error } => {
                Self::Lifecycle(LifecycleEvent::RequestFailed {
                    request_id: RequestId::new(request_id),
                    error,
                })
            }
            TraceEvent::ContextDestroyed { context_id } => {
                Self::Lifecycle(LifecycleEvent::ContextDestroyed {
                    context_id: ContextId(context_id),
                })
            }
        }
    }
}

pub fn parse_trace(reader: impl BufRead) -> anyhow::Result<Vec<TraceEvent>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_number = index + 1;
        let line = line.with_context(|| format!("read trace line {line_number}"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(trimmed)
            .with_context(|| format!("parse trace line {line_number}"))?;
        events.push(event);
    }
    Ok(events)
}

/// Stream interceptor for replays: there is no real consumer, so forwarded chunks are only
/// counted.
#[derive(Debug, Default)]
pub struct ReplayInterceptor {
    forwarded_bytes: Arc<AtomicU64>,
}

impl ReplayInterceptor {
    pub fn forwarded_bytes(&self) -> u64 {
        self.forwarded_bytes.load(Ordering::Relaxed)
    }
}

struct CountingFilter {
    forwarded_bytes: Arc<AtomicU64>,
}

impl StreamFilter for CountingFilter {
    fn write(&mut self, chunk: Bytes) -> Result<(), ForwardError> {
        let len = u64::try_from(chunk.len()).unwrap_or(u64::MAX);
        self.forwarded_bytes.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {}

    fn disconnect(&mut self) {}
}

impl StreamInterceptor for ReplayInterceptor {
    fn is_available(&self) -> bool {
        true
    }

    fn filter_response_data(
        &self,
        _request_id: &RequestId,
    ) -> Result<Box<dyn StreamFilter>, InterceptError> {
        Ok(Box::new(CountingFilter {
            forwarded_bytes: Arc::clone(&self.forwarded_bytes),
        }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    pub events: usize,
    pub tracked: usize,
    pub intercepted: usize,
    pub finalized: usize,
    pub filtered: usize,
    pub ignored: usize,
}

impl ReplaySummary {
    fn record(&mut self, outcome: &EventOutcome) {
        self.events += 1;
        match outcome {
            EventOutcome::Tracked(_) => self.tracked += 1,
            EventOutcome::Intercepted => self.intercepted += 1,
            EventOutcome::Finalized => self.finalized += 1,
            EventOutcome::Filtered(_) => self.filtered += 1,
            EventOutcome::Ignored => self.ignored += 1,
            EventOutcome::Updated | EventOutcome::Purged(_) => {}
        }
    }
}

/// Feeds `events` to `coordinator` in order, awaiting each stream finalization.
pub async fn replay(
    coordinator: &CaptureCoordinator,
    events: impl IntoIterator<Item = TraceEvent>,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    for event in events {
        let outcome = match TraceStep::from(event) {
            TraceStep::Lifecycle(event) => coordinator.handle_event(event),
            TraceStep::Stream(event) => coordinator.handle_stream_event(event).await,
        };
        tracing::trace!(?outcome, "replayed trace event");
        summary.record(&outcome);
    }
    summary
}
