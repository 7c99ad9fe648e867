//! Capture coordinator.
//!
//! Drives the correlation table from host lifecycle events, attaches a [`StreamCapture`] when a
//! response qualifies, and writes finished entries into the [`EntryStore`]. Lifecycle and chunk
//! handlers are synchronous and never wait on anything; the only suspension point is
//! [`CaptureCoordinator::stream_stopped`], which joins the asynchronous policy decision.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
    config::{CaptureConfig, Config},
    entry::{
        CaptureEntry, CapturedRequest, CapturedResponse, ContextId, EntryId, EntryIdGenerator,
        EntryUpdate, Headers, RequestId, now_unix_ms,
    },
    matching::{CapturePolicy, FilterReason, PatternError, is_text_content},
    storage::{CaptureStats, EntrySearch, EntryStore, SizeInfo},
    stream::{FinalizeOutcome, PolicyDecision, StreamCapture, StreamInterceptor},
};

pub const COMPLETED_WITHOUT_RESPONSE: &str = "request completed without response headers";

pub type PolicyFuture = Pin<Box<dyn Future<Output = anyhow::Result<CaptureConfig>> + Send>>;

/// Asynchronous source of the current capture configuration.
pub trait PolicyStore: Send + Sync {
    fn load(&self) -> PolicyFuture;
}

/// In-memory policy store. Cloning shares the underlying configuration.
#[derive(Debug, Clone, Default)]
pub struct SharedPolicy {
    config: Arc<RwLock<CaptureConfig>>,
}

impl SharedPolicy {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn replace(&self, config: CaptureConfig) {
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }
}

impl PolicyStore for SharedPolicy {
    fn load(&self) -> PolicyFuture {
        let config = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        Box::pin(async move { Ok(config) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    RequestObserved {
        request_id: RequestId,
        url: String,
        method: String,
        resource_type: Option<String>,
        context_id: Option<ContextId>,
        request_body: Option<String>,
    },
    RequestHeaders {
        request_id: RequestId,
        headers: Headers,
    },
    ResponseHeaders {
        request_id: RequestId,
        status: u16,
        status_text: String,
        headers: Headers,
    },
    RequestCompleted {
        request_id: RequestId,
    },
    RequestFailed {
        request_id: RequestId,
        error: String,
    },
    ContextDestroyed {
        context_id: ContextId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Start { request_id: RequestId },
    Data { request_id: RequestId, chunk: Bytes },
    Stop { request_id: RequestId },
    Error { request_id: RequestId, error: String },
}

/// What a handler did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A new pending entry was created.
    Tracked(EntryId),
    Updated,
    /// Response stream is being captured.
    Intercepted,
    /// The entry reached a terminal state.
    Finalized,
    Filtered(FilterReason),
    /// Purged correlations and capture units of a destroyed context.
    Purged(usize),
    /// Unknown or duplicate request; nothing changed.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStage {
    Observed,
    HeadersKnown,
    ResponseHeadersKnown,
    Streaming,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub timestamp: i64,
}

/// Everything learned so far about one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCorrelation {
    pub entry_id: EntryId,
    pub url: String,
    pub resource_type: Option<String>,
    pub context_id: Option<ContextId>,
    pub content_type: Option<String>,
    pub response: Option<ResponseMeta>,
    pub stage: CorrelationStage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStats {
    /// Requests that became entries.
    pub total_captured: u64,
    /// Filter decisions, including response bodies declined for tracked requests.
    pub total_filtered: u64,
    pub last_captured_url: Option<String>,
    pub last_filtered_url: Option<String>,
    pub last_filter_reason: Option<FilterReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub stream_interception_available: bool,
    pub capture_active: bool,
    pub pending_requests: usize,
}

#[derive(Debug)]
struct AttachedCapture {
    unit: StreamCapture,
    context_id: Option<ContextId>,
    url: String,
    response: ResponseMeta,
}

struct CoordinatorState {
    active: bool,
    capture_config: CaptureConfig,
    policy: CapturePolicy,
    correlations: HashMap<RequestId, PendingCorrelation>,
    captures: HashMap<RequestId, AttachedCapture>,
    /// Units between stream stop and the policy join. Removing a key cancels the write.
    finalizing: HashMap<RequestId, Option<ContextId>>,
    store: EntryStore,
    stats: FilterStats,
}

impl CoordinatorState {
    fn record_captured(&mut self, url: &str) {
        self.stats.total_captured += 1;
        self.stats.last_captured_url = Some(url.to_owned());
    }

    fn record_filtered(&mut self, url: &str, reason: FilterReason) {
        self.stats.total_filtered += 1;
        self.stats.last_filtered_url = Some(url.to_owned());
        self.stats.last_filter_reason = Some(reason);
        if self.policy.log_filtered_requests() {
            tracing::debug!(url, %reason, "request filtered");
        }
    }

    fn complete_header_only(&mut self, entry_id: &EntryId, response: ResponseMeta, body_size: u64) {
        let response = CapturedResponse {
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            body: String::new(),
            timestamp: response.timestamp,
            body_size,
        };
        if !self.store.update(entry_id, EntryUpdate::completed(response)) {
            tracing::debug!(%entry_id, "entry evicted before completion");
        }
    }
}

/// Inputs of one asynchronous body-policy lookup.
#[derive(Debug, Clone)]
struct PolicyQuery {
    url: String,
    resource_type: Option<String>,
    status: u16,
    content_type: Option<String>,
}

/// Cloning yields another handle to the same coordinator.
#[derive(Clone)]
pub struct CaptureCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    interceptor: Arc<dyn StreamInterceptor>,
    policy_store: Arc<dyn PolicyStore>,
    ids: Arc<EntryIdGenerator>,
}

impl std::fmt::Debug for CaptureCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CaptureCoordinator")
            .field("active", &state.active)
            .field("pending", &state.correlations.len())
            .field("captures", &state.captures.len())
            .field("entries", &state.store.len())
            .finish_non_exhaustive()
    }
}

impl CaptureCoordinator {
    pub fn new(
        config: &Config,
        interceptor: Arc<dyn StreamInterceptor>,
        policy_store: Arc<dyn PolicyStore>,
    ) -> Result<Self, PatternError> {
        let policy = CapturePolicy::from_config(&config.capture)?;
        Ok(Self {
            state: Arc::new(Mutex::new(CoordinatorState {
                active: true,
                capture_config: config.capture.clone(),
                policy,
                correlations: HashMap::new(),
                captures: HashMap::new(),
                finalizing: HashMap::new(),
                store: EntryStore::new(config.storage.max_entries),
                stats: FilterStats::default(),
            })),
            interceptor,
            policy_store,
            ids: Arc::new(EntryIdGenerator::new()),
        })
    }

    /// Coordinator whose asynchronous policy lookups read `config.capture`.
    pub fn with_static_policy(
        config: &Config,
        interceptor: Arc<dyn StreamInterceptor>,
    ) -> Result<Self, PatternError> {
        let store = SharedPolicy::new(config.capture.clone());
        Self::new(config, interceptor, Arc::new(store))
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start(&self) {
        let mut state = self.lock();
        if !state.active {
            state.active = true;
            tracing::info!("capture started");
        }
    }

    /// Stops capturing and tears down every in-flight correlation and capture unit. Stored
    /// entries are kept as they are.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.active = false;
        let pending = state.correlations.len();
        state.correlations.clear();
        for (_, attached) in state.captures.drain() {
            attached.unit.abort();
        }
        let finalizing = state.finalizing.len();
        state.finalizing.clear();
        tracing::info!(pending, finalizing, "capture stopped");
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Swaps the cached policy and resizes the entry store. The policy store is not touched.
    pub fn set_config(&self, config: &Config) -> Result<(), PatternError> {
        let policy = CapturePolicy::from_config(&config.capture)?;
        let mut state = self.lock();
        state.policy = policy;
        state.capture_config = config.capture.clone();
        let evicted = state.store.set_max_entries(config.storage.max_entries);
        tracing::info!(
            max_entries = state.store.max_entries(),
            evicted,
            "capture configuration updated"
        );
        Ok(())
    }

    pub fn handle_event(&self, event: LifecycleEvent) -> EventOutcome {
        match event {
            LifecycleEvent::RequestObserved {
                request_id,
                url,
                method,
                resource_type,
                context_id,
                request_body,
            } => self.request_observed(
                request_id,
                url,
                method,
                resource_type,
                context_id,
                request_body,
            ),
            LifecycleEvent::RequestHeaders {
                request_id,
                headers,
            } => self.request_headers(&request_id, headers),
            LifecycleEvent::ResponseHeaders {
                request_id,
                status,
                status_text,
                headers,
            } => self.response_headers(request_id, status, status_text, headers),
            LifecycleEvent::RequestCompleted { request_id } => self.request_completed(&request_id),
            LifecycleEvent::RequestFailed { request_id, error } => {
                self.request_failed(&request_id, &error)
            }
            LifecycleEvent::ContextDestroyed { context_id } => self.context_destroyed(context_id),
        }
    }

    pub async fn handle_stream_event(&self, event: StreamEvent) -> EventOutcome {
        match event {
            StreamEvent::Start { request_id } => self.stream_started(&request_id),
            StreamEvent::Data { request_id, chunk } => self.stream_data(&request_id, chunk),
            StreamEvent::Stop { request_id } => self.stream_stopped(&request_id).await,
            StreamEvent::Error { request_id, error } => self.stream_error(&request_id, &error),
        }
    }

    fn request_observed(
        &self,
        request_id: RequestId,
        url: String,
        method: String,
        resource_type: Option<String>,
        context_id: Option<ContextId>,
        request_body: Option<String>,
    ) -> EventOutcome {
        let mut state = self.lock();
        if !state.active {
            return EventOutcome::Ignored;
        }
        if state.correlations.contains_key(&request_id) {
            tracing::warn!(%request_id, %url, "duplicate request observation ignored");
            return EventOutcome::Ignored;
        }
        if let Err(reason) = state.policy.check_request(&url, resource_type.as_deref()) {
            state.record_filtered(&url, reason);
            return EventOutcome::Filtered(reason);
        }

        let entry_id = self.ids.next_id();
        let request = CapturedRequest {
            id: entry_id.clone(),
            url: url.clone(),
            method,
            headers: Headers::new(),
            request_body: request_body.filter(|_| state.policy.capture_request_body()),
            timestamp: now_unix_ms(),
            resource_type: resource_type.clone(),
        };
        let evicted = state.store.add(CaptureEntry::pending(request));
        if evicted > 0 {
            tracing::debug!(evicted, "entry store at capacity; evicted oldest entries");
        }
        state.record_captured(&url);
        tracing::debug!(%request_id, %entry_id, %url, "tracking request");
        state.correlations.insert(
            request_id,
            PendingCorrelation {
                entry_id: entry_id.clone(),
                url,
                resource_type,
                context_id,
                content_type: None,
                response: None,
                stage: CorrelationStage::Observed,
            },
        );
        EventOutcome::Tracked(entry_id)
    }

    fn request_headers(&self, request_id: &RequestId, headers: Headers) -> EventOutcome {
        let mut state = self.lock();
        let Some(correlation) = state.correlations.get_mut(request_id) else {
            tracing::debug!(%request_id, "request headers for unknown request");
            return EventOutcome::Ignored;
        };
        if correlation.stage == CorrelationStage::Observed {
            correlation.stage = CorrelationStage::HeadersKnown;
        }
        let entry_id = correlation.entry_id.clone();
        state
            .store
            .update(&entry_id, EntryUpdate::request_headers(headers));
        EventOutcome::Updated
    }

    fn response_headers(
        &self,
        request_id: RequestId,
        status: u16,
        status_text: String,
        headers: Headers,
    ) -> EventOutcome {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(correlation) = state.correlations.get_mut(&request_id) else {
            tracing::debug!(%request_id, status, "response headers for unknown request");
            return EventOutcome::Ignored;
        };
        if state.captures.contains_key(&request_id) {
            tracing::warn!(%request_id, status, "response stream already intercepted");
            return EventOutcome::Ignored;
        }

        let content_type = headers.content_type().map(str::to_owned);
        let response = ResponseMeta {
            status,
            status_text,
            headers,
            timestamp: now_unix_ms(),
        };
        correlation.content_type = content_type.clone();
        correlation.response = Some(response.clone());
        correlation.stage = CorrelationStage::ResponseHeadersKnown;
        let entry_id = correlation.entry_id.clone();
        let url = correlation.url.clone();
        let resource_type = correlation.resource_type.clone();
        let context_id = correlation.context_id;

        if let Err(reason) = state.policy.check_body(
            &url,
            resource_type.as_deref(),
            status,
            content_type.as_deref(),
        ) {
            state.record_filtered(&url, reason);
            return EventOutcome::Filtered(reason);
        }
        if !self.interceptor.is_available() {
            tracing::debug!(%request_id, "stream interception unavailable; body not captured");
            return EventOutcome::Updated;
        }
        let filter = match self.interceptor.filter_response_data(&request_id) {
            Ok(filter) => filter,
            Err(err) => {
                tracing::warn!(%request_id, "attach stream filter: {err}");
                return EventOutcome::Updated;
            }
        };

        if !is_text_content(content_type.as_deref()) {
            let unit = StreamCapture::new(
                request_id.clone(),
                entry_id.clone(),
                filter,
                state.policy.max_body_size(),
                None,
                state.policy.policy_wait(),
            );
            let body = unit.skip();
            tracing::debug!(
                %request_id,
                content_type = content_type.as_deref().unwrap_or_default(),
                "binary response; body not captured"
            );
            state.correlations.remove(&request_id);
            let response = CapturedResponse {
                status: response.status,
                status_text: response.status_text,
                headers: response.headers,
                body: body.body,
                timestamp: response.timestamp,
                body_size: body.body_size,
            };
            if !state.store.update(&entry_id, EntryUpdate::completed(response)) {
                tracing::debug!(%entry_id, "entry evicted before completion");
            }
            return EventOutcome::Finalized;
        }

        let decision = self.spawn_policy_resolution(PolicyQuery {
            url: url.clone(),
            resource_type,
            status,
            content_type,
        });
        let unit = StreamCapture::new(
            request_id.clone(),
            entry_id,
            filter,
            state.policy.max_body_size(),
            decision,
            state.policy.policy_wait(),
        );
        if let Some(correlation) = state.correlations.get_mut(&request_id) {
            correlation.stage = CorrelationStage::Streaming;
        }
        state.captures.insert(
            request_id,
            AttachedCapture {
                unit,
                context_id,
                url,
                response,
            },
        );
        EventOutcome::Intercepted
    }

    /// Starts the asynchronous policy lookup. Without a runtime the cached policy, which has
    /// already approved this response, stands as the decision.
    fn spawn_policy_resolution(
        &self,
        query: PolicyQuery,
    ) -> Option<oneshot::Receiver<PolicyDecision>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let (tx, rx) = oneshot::channel();
        let policy_store = Arc::clone(&self.policy_store);
        handle.spawn(async move {
            let decision = resolve_policy(policy_store.as_ref(), &query).await;
            let _ = tx.send(decision);
        });
        Some(rx)
    }

    fn request_completed(&self, request_id: &RequestId) -> EventOutcome {
        let mut state = self.lock();
        let Some(correlation) = state.correlations.remove(request_id) else {
            tracing::debug!(%request_id, "completion for unknown request");
            return EventOutcome::Ignored;
        };
        if matches!(
            correlation.stage,
            CorrelationStage::Streaming | CorrelationStage::Finalizing
        ) {
            return EventOutcome::Updated;
        }
        match correlation.response {
            Some(response) => state.complete_header_only(&correlation.entry_id, response, 0),
            None => {
                state
                    .store
                    .update(&correlation.entry_id, EntryUpdate::failed(COMPLETED_WITHOUT_RESPONSE));
            }
        }
        EventOutcome::Finalized
    }

    fn request_failed(&self, request_id: &RequestId, error: &str) -> EventOutcome {
        let mut state = self.lock();
        let correlation = state.correlations.remove(request_id);
        let attached = state.captures.remove(request_id);
        let entry_id = match (&correlation, &attached) {
            (Some(correlation), _) => correlation.entry_id.clone(),
            (None, Some(attached)) => attached.unit.entry_id().clone(),
            (None, None) => {
                tracing::debug!(%request_id, "failure for unknown request");
                return EventOutcome::Ignored;
            }
        };
        if let Some(attached) = attached {
            attached.unit.abort();
        }
        tracing::info!(%request_id, %entry_id, error, "request failed");
        state.store.update(&entry_id, EntryUpdate::failed(error));
        EventOutcome::Finalized
    }

    fn context_destroyed(&self, context_id: ContextId) -> EventOutcome {
        let mut state = self.lock();
        let before = state.correlations.len();
        state
            .correlations
            .retain(|_, correlation| correlation.context_id != Some(context_id));
        let mut purged = before - state.correlations.len();

        let doomed: Vec<RequestId> = state
            .captures
            .iter()
            .filter(|(_, attached)| attached.context_id == Some(context_id))
            .map(|(request_id, _)| request_id.clone())
            .collect();
        for request_id in doomed {
            if let Some(attached) = state.captures.remove(&request_id) {
                attached.unit.abort();
                purged += 1;
            }
        }
        let before = state.finalizing.len();
        state
            .finalizing
            .retain(|_, owner| *owner != Some(context_id));
        purged += before - state.finalizing.len();
        if purged > 0 {
            tracing::debug!(%context_id, purged, "context destroyed; purged in-flight requests");
        }
        EventOutcome::Purged(purged)
    }

    pub fn stream_started(&self, request_id: &RequestId) -> EventOutcome {
        let mut state = self.lock();
        match state.captures.get_mut(request_id) {
            Some(attached) => {
                attached.unit.on_start();
                EventOutcome::Updated
            }
            None => EventOutcome::Ignored,
        }
    }

    pub fn stream_data(&self, request_id: &RequestId, chunk: Bytes) -> EventOutcome {
        let mut state = self.lock();
        match state.captures.get_mut(request_id) {
            Some(attached) => {
                attached.unit.on_data(chunk);
                EventOutcome::Updated
            }
            None => {
                tracing::debug!(%request_id, "chunk for request without capture unit");
                EventOutcome::Ignored
            }
        }
    }

    pub fn stream_error(&self, request_id: &RequestId, error: &str) -> EventOutcome {
        let mut state = self.lock();
        let Some(attached) = state.captures.remove(request_id) else {
            return EventOutcome::Ignored;
        };
        state.correlations.remove(request_id);
        let entry_id = attached.unit.entry_id().clone();
        attached.unit.fail(error);
        tracing::info!(%request_id, %entry_id, error, "response stream failed");
        state.store.update(&entry_id, EntryUpdate::failed(error));
        EventOutcome::Finalized
    }

    /// Finalizes a captured stream. Waits for the policy decision for at most the configured
    /// policy wait; the state lock is never held across that wait.
    pub async fn stream_stopped(&self, request_id: &RequestId) -> EventOutcome {
        let (finalization, url, response) = {
            let mut state = self.lock();
            let Some(attached) = state.captures.remove(request_id) else {
                tracing::debug!(%request_id, "stream stop for request without capture unit");
                return EventOutcome::Ignored;
            };
            if let Some(correlation) = state.correlations.get_mut(request_id) {
                correlation.stage = CorrelationStage::Finalizing;
            }
            let AttachedCapture {
                unit,
                context_id,
                url,
                response,
            } = attached;
            state.finalizing.insert(request_id.clone(), context_id);
            (unit.finish(), url, response)
        };

        let entry_id = finalization.entry_id().clone();
        let outcome = finalization.resolve().await;

        let mut state = self.lock();
        if state.finalizing.remove(request_id).is_none() {
            tracing::debug!(%request_id, %entry_id, "finalization cancelled; captured body dropped");
            return EventOutcome::Ignored;
        }
        state.correlations.remove(request_id);
        match outcome {
            FinalizeOutcome::Captured(body) => {
                tracing::info!(
                    %request_id,
                    %entry_id,
                    %url,
                    status = response.status,
                    body_size = body.body_size,
                    truncated = body.truncated,
                    "response captured"
                );
                let response = CapturedResponse {
                    status: response.status,
                    status_text: response.status_text,
                    headers: response.headers,
                    body: body.body,
                    timestamp: response.timestamp,
                    body_size: body.body_size,
                };
                if !state.store.update(&entry_id, EntryUpdate::completed(response)) {
                    tracing::debug!(%entry_id, "entry evicted before completion");
                }
            }
            FinalizeOutcome::Denied { reason, body_size } => {
                state.record_filtered(&url, reason);
                state.complete_header_only(&entry_id, response, body_size);
            }
        }
        EventOutcome::Finalized
    }

    pub fn entries(&self) -> Vec<CaptureEntry> {
        self.lock().store.get_all()
    }

    pub fn entry(&self, id: &EntryId) -> Option<CaptureEntry> {
        self.lock().store.get_by_id(id).cloned()
    }

    pub fn search(&self, search: &EntrySearch) -> Vec<CaptureEntry> {
        self.lock().store.search(search)
    }

    pub fn clear_entries(&self) {
        self.lock().store.clear();
        tracing::info!("captured entries cleared");
    }

    pub fn stats(&self) -> CaptureStats {
        self.lock().store.stats()
    }

    pub fn size_info(&self) -> SizeInfo {
        self.lock().store.size_info()
    }

    pub fn filter_stats(&self) -> FilterStats {
        self.lock().stats.clone()
    }

    pub fn capture_config(&self) -> CaptureConfig {
        self.lock().capture_config.clone()
    }

    pub fn health(&self) -> HealthStatus {
        let state = self.lock();
        HealthStatus {
            stream_interception_available: self.interceptor.is_available(),
            capture_active: state.active && state.policy.enabled(),
            pending_requests: state.correlations.len(),
        }
    }

    /// Snapshot of the correlation table.
    pub fn pending_requests(&self) -> BTreeMap<RequestId, PendingCorrelation> {
        self.lock()
            .correlations
            .iter()
            .map(|(request_id, correlation)| (request_id.clone(), correlation.clone()))
            .collect()
    }

    /// Number of live stream capture units.
    pub fn active_captures(&self) -> usize {
        self.lock().captures.len()
    }
}

async fn resolve_policy(store: &dyn PolicyStore, query: &PolicyQuery) -> PolicyDecision {
    let config = match store.load().await {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(url = %query.url, "load capture policy: {err:#}");
            return Err(FilterReason::PolicyUnavailable);
        }
    };
    let policy = match CapturePolicy::from_config(&config) {
        Ok(policy) => policy,
        Err(err) => {
            tracing::warn!(url = %query.url, "compile capture policy: {err}");
            return Err(FilterReason::PolicyUnavailable);
        }
    };
    policy.check_body(
        &query.url,
        query.resource_type.as_deref(),
        query.status,
        query.content_type.as_deref(),
    )
}
