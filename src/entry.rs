use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Host-assigned identifier that correlates every lifecycle event of one request attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a stored [`CaptureEntry`]. Minted by the coordinator, never by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Owning context of a request (a browser tab in the usual deployment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub i64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mints unique entry ids of the form `req_<unix_ms>_<seq>`.
#[derive(Debug, Default)]
pub struct EntryIdGenerator {
    next: AtomicU64,
}

impl EntryIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> EntryId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        EntryId(format!("req_{}_{seq}", now_unix_ms()))
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Header map collapsed to one value per name. Names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later values for the same (case-insensitive) name replace earlier ones.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.insert(name.as_ref(), value);
        }
        headers
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }

    pub fn merge(&mut self, other: Headers) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub id: EntryId,
    pub url: String,
    pub method: String,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: String,
    pub timestamp: i64,
    /// True number of body bytes observed on the wire, even when `body` was truncated.
    pub body_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Pending,
    Completed,
    Error,
}

impl CaptureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::str::FromStr for CaptureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "unknown capture status `{other}`; expected pending, completed or error"
            )),
        }
    }
}

/// Where an entry is in its lifecycle. A completed entry always carries a response and an
/// errored entry always carries a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EntryOutcome {
    Pending,
    Completed { response: CapturedResponse },
    Error { error: String },
}

impl EntryOutcome {
    pub fn status(&self) -> CaptureStatus {
        match self {
            Self::Pending => CaptureStatus::Pending,
            Self::Completed { .. } => CaptureStatus::Completed,
            Self::Error { .. } => CaptureStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEntry {
    pub id: EntryId,
    pub request: CapturedRequest,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CaptureEntry {
    pub fn pending(request: CapturedRequest) -> Self {
        let now = now_unix_ms();
        Self {
            id: request.id.clone(),
            request,
            outcome: EntryOutcome::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> CaptureStatus {
        self.outcome.status()
    }

    pub fn response(&self) -> Option<&CapturedResponse> {
        match &self.outcome {
            EntryOutcome::Completed { response } => Some(response),
            EntryOutcome::Pending | EntryOutcome::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            EntryOutcome::Error { error } => Some(error),
            EntryOutcome::Pending | EntryOutcome::Completed { .. } => None,
        }
    }

    /// Refreshes `updated_at` without ever moving it behind `created_at`.
    pub(crate) fn touch(&mut self) {
        self.updated_at = now_unix_ms().max(self.created_at).max(self.updated_at);
    }
}

/// Partial update merged into a stored entry by [`crate::storage::EntryStore::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryUpdate {
    /// Merged into the existing request headers.
    pub request_headers: Option<Headers>,
    /// Replaces a pending outcome. Terminal outcomes are final.
    pub outcome: Option<EntryOutcome>,
}

impl EntryUpdate {
    pub fn request_headers(headers: Headers) -> Self {
        Self {
            request_headers: Some(headers),
            outcome: None,
        }
    }

    pub fn completed(response: CapturedResponse) -> Self {
        Self {
            request_headers: None,
            outcome: Some(EntryOutcome::Completed { response }),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            request_headers: None,
            outcome: Some(EntryOutcome::Error {
                error: error.into(),
            }),
        }
    }
}
