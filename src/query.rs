//! Read-only query surface over a [`CaptureCoordinator`], shaped for an RPC or UI layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::CaptureConfig,
    coordinator::{CaptureCoordinator, FilterStats, HealthStatus, PendingCorrelation},
    entry::{CaptureEntry, CaptureStatus, EntryId, RequestId},
    storage::{CaptureStats, EntrySearch, SizeInfo},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueryRequest {
    GetAllEntries,
    GetEntryById {
        id: EntryId,
    },
    FilterEntries {
        #[serde(default)]
        filter: EntryFilter,
    },
    ClearAllEntries,
    GetStats,
    GetSizeInfo,
    HealthCheck,
    GetConfig,
    GetFilterStats,
    GetPendingRequests,
}

/// Wire form of an entry search. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntryFilter {
    /// Case-insensitive regex; invalid regexes fall back to substring matching.
    pub url_pattern: Option<String>,
    pub method: Option<String>,
    pub status: Option<CaptureStatus>,
    pub http_status_code: Option<u16>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
}

impl From<EntryFilter> for EntrySearch {
    fn from(filter: EntryFilter) -> Self {
        let created_between = match (filter.created_after, filter.created_before) {
            (None, None) => None,
            (start, end) => Some((start.unwrap_or(i64::MIN), end.unwrap_or(i64::MAX))),
        };
        Self {
            url_pattern: filter.url_pattern,
            method: filter.method,
            status: filter.status,
            http_status_code: filter.http_status_code,
            created_between,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueryResponse {
    Entries(Vec<CaptureEntry>),
    Entry(Box<CaptureEntry>),
    Cleared { cleared: bool },
    Stats(CaptureStats),
    SizeInfo(SizeInfo),
    Health(HealthStatus),
    Config(CaptureConfigReply),
    FilterStats(FilterStats),
    PendingRequests(BTreeMap<RequestId, PendingCorrelation>),
}

/// `[capture]` settings with the camelCase keys used by every other reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfigReply {
    pub enabled: bool,
    pub url_patterns: Vec<String>,
    pub resource_types: Vec<String>,
    pub allowed_status_codes: Vec<u16>,
    pub require_content_type: bool,
    pub capture_request_body: bool,
    pub capture_response_body: bool,
    pub max_body_size: usize,
    pub log_filtered_requests: bool,
    pub policy_wait_ms: u64,
}

impl From<CaptureConfig> for CaptureConfigReply {
    fn from(config: CaptureConfig) -> Self {
        Self {
            enabled: config.enabled,
            url_patterns: config.url_patterns,
            resource_types: config.resource_types,
            allowed_status_codes: config.allowed_status_codes,
            require_content_type: config.require_content_type,
            capture_request_body: config.capture_request_body,
            capture_response_body: config.capture_response_body,
            max_body_size: config.max_body_size,
            log_filtered_requests: config.log_filtered_requests,
            policy_wait_ms: config.policy_wait_ms,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("entry `{0}` not found")]
    NotFound(EntryId),
    #[error("invalid query: {0}")]
    InvalidRequest(#[from] serde_json::Error),
}

/// `{success, data?, error?}` envelope returned for every query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<QueryResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryReply {
    pub fn ok(data: QueryResponse) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: &QueryError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

impl From<Result<QueryResponse, QueryError>> for QueryReply {
    fn from(result: Result<QueryResponse, QueryError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failed(&err),
        }
    }
}

pub fn execute(
    coordinator: &CaptureCoordinator,
    request: QueryRequest,
) -> Result<QueryResponse, QueryError> {
    let response = match request {
        QueryRequest::GetAllEntries => QueryResponse::Entries(coordinator.entries()),
        QueryRequest::GetEntryById { id } => match coordinator.entry(&id) {
            Some(entry) => QueryResponse::Entry(Box::new(entry)),
            None => return Err(QueryError::NotFound(id)),
        },
        QueryRequest::FilterEntries { filter } => {
            QueryResponse::Entries(coordinator.search(&filter.into()))
        }
        QueryRequest::ClearAllEntries => {
            coordinator.clear_entries();
            QueryResponse::Cleared { cleared: true }
        }
        QueryRequest::GetStats => QueryResponse::Stats(coordinator.stats()),
        QueryRequest::GetSizeInfo => QueryResponse::SizeInfo(coordinator.size_info()),
        QueryRequest::HealthCheck => QueryResponse::Health(coordinator.health()),
        QueryRequest::GetConfig => QueryResponse::Config(coordinator.capture_config().into()),
        QueryRequest::GetFilterStats => QueryResponse::FilterStats(coordinator.filter_stats()),
        QueryRequest::GetPendingRequests => {
            QueryResponse::PendingRequests(coordinator.pending_requests())
        }
    };
    Ok(response)
}

pub fn dispatch(coordinator: &CaptureCoordinator, request: QueryRequest) -> QueryReply {
    execute(coordinator, request).into()
}

/// Parses a JSON query and answers it. Malformed input yields a failed reply.
pub fn dispatch_json(coordinator: &CaptureCoordinator, raw: &str) -> QueryReply {
    serde_json::from_str::<QueryRequest>(raw)
        .map_err(QueryError::from)
        .and_then(|request| execute(coordinator, request))
        .into()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use super::{EntryFilter, QueryRequest, dispatch, dispatch_json};
    use crate::{
        config::Config,
        coordinator::{CaptureCoordinator, EventOutcome, LifecycleEvent},
        entry::{CaptureStatus, EntryId, Headers, RequestId},
        storage::EntrySearch,
        stream::test_support::RecordingInterceptor,
    };

    fn seeded() -> (CaptureCoordinator, EntryId) {
        let coordinator = CaptureCoordinator::with_static_policy(
            &Config::default(),
            Arc::new(RecordingInterceptor::default()),
        )
        .expect("build coordinator");
        let mut first = None;
        for (id, method, url) in [
            ("r1", "GET", "https://api.example.test/users"),
            ("r2", "POST", "https://api.example.test/users"),
            ("r3", "GET", "https://cdn.example.test/app.js"),
        ] {
            let outcome = coordinator.handle_event(LifecycleEvent::RequestObserved {
                request_id: RequestId::from(id),
                url: url.to_owned(),
                method: method.to_owned(),
                resource_type: Some("xmlhttprequest".to_owned()),
                context_id: None,
                request_body: None,
            });
            if first.is_none()
                && let EventOutcome::Tracked(entry_id) = outcome
            {
                first = Some(entry_id);
            }
        }
        coordinator.handle_event(LifecycleEvent::ResponseHeaders {
            request_id: RequestId::from("r1"),
            status: 404,
            status_text: "Not Found".to_owned(),
            headers: Headers::new(),
        });
        coordinator.handle_event(LifecycleEvent::RequestCompleted {
            request_id: RequestId::from("r1"),
        });
        (coordinator, first.expect("entries tracked"))
    }

    fn reply_json(reply: super::QueryReply) -> Value {
        serde_json::to_value(reply).expect("serialize reply")
    }

    #[test]
    fn request_wire_shape_uses_type_tag() {
        let request: QueryRequest =
            serde_json::from_value(json!({"type": "getEntryById", "id": "req_1_0"})).unwrap();
        assert_eq!(
            request,
            QueryRequest::GetEntryById {
                id: EntryId::from("req_1_0")
            }
        );
        let request: QueryRequest = serde_json::from_value(json!({"type": "filterEntries"})).unwrap();
        assert_eq!(
            request,
            QueryRequest::FilterEntries {
                filter: EntryFilter::default()
            }
        );
    }

    #[test]
    fn get_all_entries_is_newest_first() {
        let (coordinator, _) = seeded();
        let value = reply_json(dispatch(&coordinator, QueryRequest::GetAllEntries));
        assert_eq!(value["success"], true);
        let urls: Vec<&str> = value["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["request"]["url"].as_str().unwrap())
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example.test/app.js",
                "https://api.example.test/users",
                "https://api.example.test/users",
            ]
        );
    }

    #[test]
    fn missing_entry_reports_failure() {
        let (coordinator, _) = seeded();
        let value = reply_json(dispatch(
            &coordinator,
            QueryRequest::GetEntryById {
                id: EntryId::from("req_0_999"),
            },
        ));
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "entry `req_0_999` not found");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn entry_by_id_carries_flattened_status() {
        let (coordinator, first) = seeded();
        let value = reply_json(dispatch(&coordinator, QueryRequest::GetEntryById { id: first }));
        assert_eq!(value["data"]["status"], "completed");
        assert_eq!(value["data"]["response"]["status"], 404);
        assert_eq!(value["data"]["response"]["bodySize"], 0);
    }

    #[test]
    fn filter_entries_combines_conditions() {
        let (coordinator, _) = seeded();
        let value = reply_json(dispatch_json(
            &coordinator,
            r#"{"type":"filterEntries","filter":{"urlPattern":"users","method":"get"}}"#,
        ));
        assert_eq!(value["data"].as_array().unwrap().len(), 1);

        let value = reply_json(dispatch_json(
            &coordinator,
            r#"{"type":"filterEntries","filter":{"status":"pending"}}"#,
        ));
        assert_eq!(value["data"].as_array().unwrap().len(), 2);

        let value = reply_json(dispatch_json(
            &coordinator,
            r#"{"type":"filterEntries","filter":{"httpStatusCode":404}}"#,
        ));
        assert_eq!(value["data"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn entry_filter_maps_open_time_bounds() {
        let search: EntrySearch = EntryFilter {
            created_after: Some(10),
            status: Some(CaptureStatus::Error),
            ..EntryFilter::default()
        }
        .into();
        assert_eq!(search.created_between, Some((10, i64::MAX)));
        assert_eq!(search.status, Some(CaptureStatus::Error));
        assert_eq!(EntrySearch::from(EntryFilter::default()).created_between, None);
    }

    #[test]
    fn stats_health_and_size_shapes() {
        let (coordinator, _) = seeded();
        let stats = reply_json(dispatch(&coordinator, QueryRequest::GetStats));
        assert_eq!(stats["data"]["totalEntries"], 3);
        assert_eq!(stats["data"]["completedEntries"], 1);
        assert_eq!(stats["data"]["pendingEntries"], 2);
        assert_eq!(stats["data"]["errorEntries"], 0);

        let size = reply_json(dispatch(&coordinator, QueryRequest::GetSizeInfo));
        assert_eq!(size["data"]["current"], 3);
        assert_eq!(size["data"]["max"], 100);
        assert_eq!(size["data"]["nearCapacity"], false);
        assert!(size["data"]["memoryUsage"].as_u64().unwrap() > 0);

        let health = reply_json(dispatch(&coordinator, QueryRequest::HealthCheck));
        assert_eq!(health["data"]["streamInterceptionAvailable"], true);
        assert_eq!(health["data"]["captureActive"], true);

        let config = reply_json(dispatch(&coordinator, QueryRequest::GetConfig));
        assert_eq!(config["data"]["urlPatterns"], json!(["<all_urls>"]));
        assert_eq!(config["data"]["maxBodySize"], 1024 * 1024);
        assert_eq!(config["data"]["policyWaitMs"], 500);
        assert!(config["data"].get("url_patterns").is_none());

        let filter_stats = reply_json(dispatch(&coordinator, QueryRequest::GetFilterStats));
        assert_eq!(filter_stats["data"]["totalCaptured"], 3);
        assert_eq!(
            filter_stats["data"]["lastFilterReason"],
            json!({"reason": "status_code", "code": 404})
        );

        let pending = reply_json(dispatch(&coordinator, QueryRequest::GetPendingRequests));
        assert_eq!(pending["data"]["r2"]["stage"], "observed");
    }

    #[test]
    fn clear_all_entries_empties_the_store() {
        let (coordinator, _) = seeded();
        let value = reply_json(dispatch(&coordinator, QueryRequest::ClearAllEntries));
        assert_eq!(value["data"], json!({"cleared": true}));
        assert!(coordinator.entries().is_empty());
    }

    #[test]
    fn malformed_json_is_a_failed_reply() {
        let (coordinator, _) = seeded();
        let value = reply_json(dispatch_json(&coordinator, r#"{"type":"dropDatabase"}"#));
        assert_eq!(value["success"], false);
        assert!(
            value["error"]
                .as_str()
                .unwrap()
                .starts_with("invalid query:")
        );
    }
}
