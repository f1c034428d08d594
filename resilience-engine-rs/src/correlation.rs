//! # Error Correlation
//!
//! Groups failures of the same kind, at the same place, for the same actor
//! into time-windowed buckets.
//!
//! The window is enforced by filtering on every read and write; there is no
//! background sweep of this table. A group's `count` only ever grows, even as
//! its events age out of the window.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::context::RequestContext;
use crate::types::AppError;

const KEY_DELIMITER: &str = ":";

/// Derives the correlation key for an error raised while serving a request
pub fn generate_key(error: &AppError, ctx: &RequestContext) -> String {
    [
        error.name.as_str(),
        ctx.method.as_str(),
        ctx.path.as_str(),
        ctx.actor(),
    ]
    .join(KEY_DELIMITER)
}

/// One handled failure
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub endpoint: String,
    pub method: String,
}

impl ErrorEvent {
    pub fn new(error: &AppError, ctx: &RequestContext, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            message: error.message.clone(),
            stack: error.stack.clone(),
            request_id: Some(ctx.request_id.clone()),
            user_id: ctx.user_id.clone(),
            endpoint: ctx.path.clone(),
            method: ctx.method.clone(),
        }
    }
}

/// All recent events for one correlation key
#[derive(Debug, Clone)]
pub struct CorrelationGroup {
    pub key: String,
    /// Oldest first
    pub events: VecDeque<ErrorEvent>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Lifetime occurrences; never decremented
    pub count: u64,
}

impl CorrelationGroup {
    fn new(key: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            events: VecDeque::new(),
            first_seen: now,
            last_seen: now,
            count: 0,
        }
    }

    /// Drops events that fell out of the window
    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while self
            .events
            .front()
            .is_some_and(|event| now - event.timestamp >= window)
        {
            self.events.pop_front();
        }
    }

    fn summary(&self) -> GroupSummary {
        GroupSummary {
            key: self.key.clone(),
            count: self.count,
            window_events: self.events.len(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// Read-only view of a group at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub key: String,
    pub count: u64,
    pub window_events: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Outcome of recording one error
#[derive(Debug, Clone)]
pub struct CorrelationResult {
    pub key: String,
    /// Group state after the new event was appended
    pub group: GroupSummary,
    /// Events inside the window before the new one was added
    pub related_count: usize,
    pub is_recurring: bool,
    /// `related_count + 1`
    pub frequency: usize,
}

/// Concurrent correlation table
#[derive(Debug)]
pub struct ErrorCorrelator {
    groups: DashMap<String, CorrelationGroup>,
    window: chrono::Duration,
}

impl ErrorCorrelator {
    pub fn new(window: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::minutes(1)),
        }
    }

    /// Records an error under `key` now
    pub fn record_error(&self, key: &str, error: &AppError, ctx: &RequestContext) -> CorrelationResult {
        self.record_error_at(key, error, ctx, Utc::now())
    }

    /// Records an error under `key` at the given instant
    pub fn record_error_at(
        &self,
        key: &str,
        error: &AppError,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> CorrelationResult {
        // expired groups go away on the next unrelated access
        self.prune_except(key, now);

        let event = ErrorEvent::new(error, ctx, now);
        let (related_count, summary) = {
            let mut group = self
                .groups
                .entry(key.to_string())
                .or_insert_with(|| CorrelationGroup::new(key, now));

            group.prune(now, self.window);
            let related_count = group.events.len();

            group.events.push_back(event);
            group.count += 1;
            group.last_seen = now;
            (related_count, group.summary())
        };

        CorrelationResult {
            key: key.to_string(),
            group: summary,
            is_recurring: related_count > 0,
            related_count,
            frequency: related_count + 1,
        }
    }

    /// Current view of one group, if it still has events in the window
    pub fn group(&self, key: &str) -> Option<GroupSummary> {
        self.group_at(key, Utc::now())
    }

    pub fn group_at(&self, key: &str, now: DateTime<Utc>) -> Option<GroupSummary> {
        self.prune_all(now);
        self.groups.get(key).map(|group| group.summary())
    }

    /// Groups ordered by lifetime count, largest first
    pub fn top_groups(&self, limit: usize) -> Vec<GroupSummary> {
        self.top_groups_at(limit, Utc::now())
    }

    pub fn top_groups_at(&self, limit: usize, now: DateTime<Utc>) -> Vec<GroupSummary> {
        self.prune_all(now);
        let mut groups: Vec<GroupSummary> = self.groups.iter().map(|g| g.summary()).collect();
        groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        groups.truncate(limit);
        groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&self) {
        self.groups.clear();
    }

    fn prune_all(&self, now: DateTime<Utc>) {
        let window = self.window;
        self.groups.retain(|_, group| {
            group.prune(now, window);
            !group.events.is_empty()
        });
    }

    fn prune_except(&self, key: &str, now: DateTime<Utc>) {
        let window = self.window;
        self.groups.retain(|k, group| {
            if k == key {
                return true;
            }
            group.prune(now, window);
            !group.events.is_empty()
        });
    }
}
