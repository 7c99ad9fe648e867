use std::collections::{HashMap, VecDeque};

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::entry::{CaptureEntry, CaptureStatus, EntryId, EntryUpdate};

/// Share of `max_entries` at which [`SizeInfo::near_capacity`] turns on, in tenths.
const NEAR_CAPACITY_TENTHS: usize = 9;

/// Bounded, insertion-ordered set of capture entries with FIFO eviction.
///
/// Eviction always removes the entries with the smallest insertion sequence, whatever their
/// status. A pending entry evicted mid-flight is dropped; later updates for it are no-ops.
#[derive(Debug)]
pub struct EntryStore {
    entries: HashMap<EntryId, StoredEntry>,
    // One slot per stored id; evicted ids leave nothing behind.
    order: VecDeque<(u64, EntryId)>,
    next_seq: u64,
    max_entries: usize,
}

#[derive(Debug)]
struct StoredEntry {
    seq: u64,
    entry: CaptureEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub total_entries: usize,
    pub completed_entries: usize,
    pub pending_entries: usize,
    pub error_entries: usize,
    /// Sum of retained response body bytes.
    pub total_data_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_capture_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeInfo {
    pub current: usize,
    pub max: usize,
    pub percentage: f64,
    pub near_capacity: bool,
    /// Rough footprint: the JSON-encoded size of every stored entry, in bytes.
    pub memory_usage: u64,
}

/// Conjunction of optional entry filters. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrySearch {
    pub url_pattern: Option<String>,
    pub method: Option<String>,
    pub status: Option<CaptureStatus>,
    pub http_status_code: Option<u16>,
    pub created_between: Option<(i64, i64)>,
}

impl EntryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            max_entries: max_entries.max(1),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts `entry` as the newest and evicts the oldest entries beyond capacity. Returns the
    /// number of evicted entries.
    pub fn add(&mut self, entry: CaptureEntry) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = entry.id.clone();
        if self.entries.contains_key(&id) {
            self.order.retain(|(_, slot)| *slot != id);
            tracing::debug!(entry_id = %id, "entry id re-added; previous slot replaced");
        }
        self.order.push_back((seq, id.clone()));
        self.entries.insert(id, StoredEntry { seq, entry });
        self.prune(self.max_entries)
    }

    /// Merges `update` into the entry with `id`. Returns `false` if no such entry exists.
    pub fn update(&mut self, id: &EntryId, update: EntryUpdate) -> bool {
        let Some(stored) = self.entries.get_mut(id) else {
            tracing::debug!(entry_id = %id, "update for unknown entry ignored");
            return false;
        };
        let entry = &mut stored.entry;

        if let Some(headers) = update.request_headers {
            entry.request.headers.merge(headers);
        }
        if let Some(outcome) = update.outcome {
            if entry.status().is_terminal() {
                tracing::debug!(
                    entry_id = %id,
                    status = entry.status().as_str(),
                    attempted = outcome.status().as_str(),
                    "entry already terminal; outcome change ignored"
                );
            } else {
                entry.outcome = outcome;
            }
        }
        entry.touch();
        true
    }

    /// All entries, newest first.
    pub fn get_all(&self) -> Vec<CaptureEntry> {
        self.iter_newest_first().cloned().collect()
    }

    pub fn get_by_id(&self, id: &EntryId) -> Option<&CaptureEntry> {
        self.entries.get(id).map(|stored| &stored.entry)
    }

    /// Entries satisfying `predicate`, newest first.
    pub fn filter(&self, predicate: impl Fn(&CaptureEntry) -> bool) -> Vec<CaptureEntry> {
        self.iter_newest_first()
            .filter(|entry| predicate(entry))
            .cloned()
            .collect()
    }

    /// Case-insensitive regex match on the request URL; falls back to a case-insensitive
    /// substring match when `pattern` is not a valid regex.
    pub fn get_by_url_pattern(&self, pattern: &str) -> Vec<CaptureEntry> {
        let matcher = UrlMatcher::new(pattern);
        self.filter(|entry| matcher.is_match(&entry.request.url))
    }

    pub fn get_by_method(&self, method: &str) -> Vec<CaptureEntry> {
        self.filter(|entry| entry.request.method.eq_ignore_ascii_case(method))
    }

    pub fn get_by_status(&self, status: CaptureStatus) -> Vec<CaptureEntry> {
        self.filter(|entry| entry.status() == status)
    }

    pub fn get_by_status_code(&self, status_code: u16) -> Vec<CaptureEntry> {
        self.filter(|entry| entry.response().is_some_and(|r| r.status == status_code))
    }

    /// Entries created within `[start, end]` (unix ms, inclusive).
    pub fn get_by_time_range(&self, start: i64, end: i64) -> Vec<CaptureEntry> {
        self.filter(|entry| entry.created_at >= start && entry.created_at <= end)
    }

    pub fn search(&self, search: &EntrySearch) -> Vec<CaptureEntry> {
        let url_matcher = search.url_pattern.as_deref().map(UrlMatcher::new);
        self.filter(|entry| {
            url_matcher
                .as_ref()
                .is_none_or(|matcher| matcher.is_match(&entry.request.url))
                && search
                    .method
                    .as_deref()
                    .is_none_or(|method| entry.request.method.eq_ignore_ascii_case(method))
                && search.status.is_none_or(|status| entry.status() == status)
                && search.http_status_code.is_none_or(|code| {
                    entry.response().is_some_and(|response| response.status == code)
                })
                && search.created_between.is_none_or(|(start, end)| {
                    entry.created_at >= start && entry.created_at <= end
                })
        })
    }

    pub fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.order.clear();
        self.next_seq = 0;
        tracing::debug!(cleared = count, "entry store cleared");
    }

    /// Evicts oldest entries until at most `max_entries` remain. Returns the number evicted.
    pub fn prune(&mut self, max_entries: usize) -> usize {
        let mut evicted = 0usize;
        while self.entries.len() > max_entries {
            let Some((seq, id)) = self.order.pop_front() else {
                break;
            };
            if self
                .entries
                .get(&id)
                .is_some_and(|stored| stored.seq == seq)
            {
                self.entries.remove(&id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(
                evicted,
                remaining = self.entries.len(),
                "pruned oldest entries"
            );
        }
        evicted
    }

    /// Changes capacity, evicting oldest entries if the store is now over it.
    pub fn set_max_entries(&mut self, max_entries: usize) -> usize {
        self.max_entries = max_entries.max(1);
        self.prune(self.max_entries)
    }

    pub fn stats(&self) -> CaptureStats {
        let mut stats = CaptureStats {
            total_entries: self.entries.len(),
            ..CaptureStats::default()
        };
        for stored in self.entries.values() {
            let entry = &stored.entry;
            match entry.status() {
                CaptureStatus::Pending => stats.pending_entries += 1,
                CaptureStatus::Completed => stats.completed_entries += 1,
                CaptureStatus::Error => stats.error_entries += 1,
            }
            if let Some(response) = entry.response() {
                stats.total_data_size = stats
                    .total_data_size
                    .saturating_add(u64::try_from(response.body.len()).unwrap_or(u64::MAX));
            }
            stats.last_capture_time = stats.last_capture_time.max(Some(entry.updated_at));
        }
        stats
    }

    pub fn is_near_capacity(&self) -> bool {
        self.entries.len() * 10 >= self.max_entries * NEAR_CAPACITY_TENTHS
    }

    pub fn size_info(&self) -> SizeInfo {
        let current = self.entries.len();
        SizeInfo {
            current,
            max: self.max_entries,
            percentage: current as f64 / self.max_entries as f64 * 100.0,
            near_capacity: self.is_near_capacity(),
            memory_usage: self.memory_usage(),
        }
    }

    pub fn memory_usage(&self) -> u64 {
        self.entries
            .values()
            .map(|stored| {
                serde_json::to_vec(&stored.entry)
                    .map_or(0, |encoded| u64::try_from(encoded.len()).unwrap_or(u64::MAX))
            })
            .fold(0, u64::saturating_add)
    }

    fn iter_newest_first(&self) -> impl Iterator<Item = &CaptureEntry> {
        self.order.iter().rev().filter_map(|(seq, id)| {
            self.entries
                .get(id)
                .filter(|stored| stored.seq == *seq)
                .map(|stored| &stored.entry)
        })
    }
}

enum UrlMatcher {
    Regex(regex::Regex),
    Substring(String),
}

impl UrlMatcher {
    fn new(pattern: &str) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => Self::Regex(regex),
            Err(_) => Self::Substring(pattern.to_lowercase()),
        }
    }

    fn is_match(&self, url: &str) -> bool {
        match self {
            Self::Regex(regex) => regex.is_match(url),
            Self::Substring(needle) => url.to_lowercase().contains(needle),
        }
    }
}
