use std::{collections::HashSet, fmt, time::Duration};

use regex::Regex;
use serde::Serialize;

use crate::config::CaptureConfig;

/// Sentinel pattern that matches every URL.
pub const ALL_URLS: &str = "<all_urls>";

const VALID_SCHEMES: [&str; 5] = ["*", "http", "https", "ftp", "file"];

const TEXT_CONTENT_TYPES: [&str; 5] = [
    "text/",
    "application/json",
    "application/javascript",
    "application/xml",
    "application/x-www-form-urlencoded",
];

const INTERNAL_URL_PREFIXES: [&str; 2] = ["moz-extension://", "chrome-extension://"];

const INTERNAL_DOMAINS: [&str; 5] = [
    "safebrowsing.googleapis.com",
    "safebrowsing-cache.google.com",
    "shavar.services.mozilla.com",
    "tracking-protection.cdn.mozilla.net",
    "firefox.settings.services.mozilla.com",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("missing `://` between scheme and host")]
    MissingSchemeSeparator,
    #[error("unsupported scheme `{0}`; expected one of *, http, https, ftp, file")]
    UnsupportedScheme(String),
    #[error("missing host")]
    MissingHost,
    #[error("missing path; patterns look like `scheme://host/path`")]
    MissingPath,
    #[error("compile pattern: {0}")]
    Compile(String),
}

/// Checks the `scheme://host/path` shape. Malformed patterns are rejected here, at
/// configuration time, so matching itself never fails.
pub fn validate_url_pattern(pattern: &str) -> Result<(), PatternError> {
    if pattern == ALL_URLS {
        return Ok(());
    }

    let Some((scheme, rest)) = pattern.split_once("://") else {
        return Err(PatternError::MissingSchemeSeparator);
    };
    if !VALID_SCHEMES.contains(&scheme) {
        return Err(PatternError::UnsupportedScheme(scheme.to_owned()));
    }
    let Some(path_start) = rest.find('/') else {
        return Err(PatternError::MissingPath);
    };
    if path_start == 0 && scheme != "file" {
        return Err(PatternError::MissingHost);
    }

    Ok(())
}

/// A compiled glob-style URL pattern. `*` matches any run of characters and the whole URL
/// must match.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    regex: Option<Regex>,
}

impl UrlPattern {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        validate_url_pattern(pattern)?;
        if pattern == ALL_URLS {
            return Ok(Self {
                source: pattern.to_owned(),
                regex: None,
            });
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$"))
            .map_err(|err| PatternError::Compile(err.to_string()))?;
        Ok(Self {
            source: pattern.to_owned(),
            regex: Some(regex),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches_all(&self) -> bool {
        self.regex.is_none()
    }

    pub fn is_match(&self, url: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(url),
            None => true,
        }
    }
}

/// Why a request was not captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FilterReason {
    Disabled,
    InternalRequest,
    UrlMismatch,
    ResourceType,
    StatusCode { code: u16 },
    InvalidStatusCode { code: u16 },
    MissingContentType,
    BodyCaptureDisabled,
    PolicyUnavailable,
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("capture disabled"),
            Self::InternalRequest => f.write_str("internal request"),
            Self::UrlMismatch => f.write_str("URL pattern mismatch"),
            Self::ResourceType => f.write_str("resource type not allowed"),
            Self::StatusCode { code } => {
                write!(f, "status code {code} not allowed ({})", status_class(*code))
            }
            Self::InvalidStatusCode { code } => write!(f, "invalid status code {code}"),
            Self::MissingContentType => f.write_str("no Content-Type header"),
            Self::BodyCaptureDisabled => f.write_str("response body capture disabled"),
            Self::PolicyUnavailable => f.write_str("capture policy unavailable"),
        }
    }
}

pub fn status_class(code: u16) -> &'static str {
    match code {
        204 => "no content response",
        300..=399 => "redirect response",
        400..=499 => "client error",
        500..=u16::MAX => "server error",
        _ => "non-standard success code",
    }
}

pub fn is_valid_status_code(code: u16) -> bool {
    (200..=599).contains(&code)
}

/// Unknown content types are treated as text.
pub fn is_text_content(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };
    let lowered = content_type.to_ascii_lowercase();
    if TEXT_CONTENT_TYPES
        .iter()
        .any(|prefix| lowered.contains(prefix))
    {
        return true;
    }
    let essence = lowered.split(';').next().unwrap_or_default().trim();
    essence.ends_with("+json") || essence.ends_with("+xml")
}

/// Host-internal traffic (extension pages, browser background services) is never captured.
pub fn is_internal_url(url: &str) -> bool {
    INTERNAL_URL_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
        || INTERNAL_DOMAINS.iter().any(|domain| url.contains(domain))
}

/// Compiled capture policy. All checks are pure.
#[derive(Debug, Clone)]
pub struct CapturePolicy {
    enabled: bool,
    url_patterns: Vec<UrlPattern>,
    resource_types: HashSet<String>,
    allowed_status_codes: HashSet<u16>,
    require_content_type: bool,
    capture_request_body: bool,
    capture_response_body: bool,
    max_body_size: usize,
    log_filtered_requests: bool,
    policy_wait: Duration,
}

impl CapturePolicy {
    pub fn from_config(config: &CaptureConfig) -> Result<Self, PatternError> {
        let url_patterns = config
            .url_patterns
            .iter()
            .map(|pattern| UrlPattern::compile(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            enabled: config.enabled,
            url_patterns,
            resource_types: config.resource_types.iter().cloned().collect(),
            allowed_status_codes: config
                .allowed_status_codes
                .iter()
                .copied()
                .filter(|code| is_valid_status_code(*code))
                .collect(),
            require_content_type: config.require_content_type,
            capture_request_body: config.capture_request_body,
            capture_response_body: config.capture_response_body,
            max_body_size: config.max_body_size.max(1),
            log_filtered_requests: config.log_filtered_requests,
            policy_wait: config.policy_wait(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn capture_request_body(&self) -> bool {
        self.capture_request_body
    }

    pub fn capture_response_body(&self) -> bool {
        self.capture_response_body
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    pub fn log_filtered_requests(&self) -> bool {
        self.log_filtered_requests
    }

    pub fn policy_wait(&self) -> Duration {
        self.policy_wait
    }

    /// Logical OR over the configured patterns.
    pub fn matches_url(&self, url: &str) -> bool {
        self.url_patterns.iter().any(|pattern| pattern.is_match(url))
    }

    pub fn matches_resource_type(&self, resource_type: Option<&str>) -> bool {
        if self.resource_types.is_empty() {
            return true;
        }
        resource_type.is_some_and(|kind| self.resource_types.contains(kind))
    }

    pub fn matches_status(&self, status_code: u16) -> bool {
        is_valid_status_code(status_code) && self.allowed_status_codes.contains(&status_code)
    }

    pub fn content_type_satisfied(&self, content_type: Option<&str>) -> bool {
        !self.require_content_type || content_type.is_some_and(|value| !value.trim().is_empty())
    }

    /// Checks available when a request is first observed.
    pub fn check_request(&self, url: &str, resource_type: Option<&str>) -> Result<(), FilterReason> {
        if !self.enabled {
            return Err(FilterReason::Disabled);
        }
        if is_internal_url(url) {
            return Err(FilterReason::InternalRequest);
        }
        if !self.matches_url(url) {
            return Err(FilterReason::UrlMismatch);
        }
        if !self.matches_resource_type(resource_type) {
            return Err(FilterReason::ResourceType);
        }
        Ok(())
    }

    /// Checks that can run synchronously once response headers are known.
    pub fn check_response(
        &self,
        url: &str,
        resource_type: Option<&str>,
        status_code: u16,
    ) -> Result<(), FilterReason> {
        self.check_request(url, resource_type)?;
        if !is_valid_status_code(status_code) {
            return Err(FilterReason::InvalidStatusCode { code: status_code });
        }
        if !self.matches_status(status_code) {
            return Err(FilterReason::StatusCode { code: status_code });
        }
        Ok(())
    }

    /// Full body-capture decision, including the Content-Type requirement.
    pub fn check_body(
        &self,
        url: &str,
        resource_type: Option<&str>,
        status_code: u16,
        content_type: Option<&str>,
    ) -> Result<(), FilterReason> {
        self.check_response(url, resource_type, status_code)?;
        if !self.capture_response_body {
            return Err(FilterReason::BodyCaptureDisabled);
        }
        if !self.content_type_satisfied(content_type) {
            return Err(FilterReason::MissingContentType);
        }
        Ok(())
    }
}

/// Composes every applicable check with logical AND. The status and Content-Type checks only
/// apply once a status code is known.
pub fn matches(
    url: &str,
    resource_type: Option<&str>,
    status_code: Option<u16>,
    content_type: Option<&str>,
    policy: &CapturePolicy,
) -> bool {
    match status_code {
        Some(code) => policy
            .check_body(url, resource_type, code, content_type)
            .is_ok(),
        None => policy.check_request(url, resource_type).is_ok(),
    }
}
