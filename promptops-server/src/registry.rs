// Copyright 2025 PromptOps Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Authoritative in-memory store of in-flight and recently finished tests.
//!
//! One [`TestRecord`] per live test id. Status moves forward only:
//! `running`/`processing` into one of the terminal statuses, after which the
//! record is frozen. Each non-terminal record owns a scheduled
//! runtime-ceiling timeout and a cancellation token that the executing test
//! runner is expected to observe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use promptops_core::{RegistryError, StatusSnapshot, TestStatus};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::StatusBroadcaster;

/// Tunable limits for the registry. Defaults match the deployed values:
/// tests are killed after 30 minutes and evicted after a day.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Application-level safeguard: a test running longer than this is
    /// force-failed even if nobody is watching it.
    pub max_runtime: Duration,
    /// Records older than this are eligible for eviction regardless of
    /// status.
    pub retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_runtime: Duration::from_secs(30 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

struct TestRecord {
    status: TestStatus,
    progress: Option<String>,
    results: Option<serde_json::Value>,
    error: Option<String>,
    started_at: Instant,
    user_id: String,
    project_id: String,
    // Present iff status is non-terminal.
    timeout_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl TestRecord {
    fn snapshot(&self, now: Instant) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            progress: self.progress.clone(),
            results: self.results.clone(),
            error: self.error.clone(),
            runtime_seconds: Some(now.duration_since(self.started_at).as_secs()),
        }
    }

    fn info(&self, test_id: &str, now: Instant) -> TestRecordInfo {
        TestRecordInfo {
            test_id: test_id.to_string(),
            status: self.status,
            progress: self.progress.clone(),
            error: self.error.clone(),
            user_id: self.user_id.clone(),
            project_id: self.project_id.clone(),
            runtime_ms: now.duration_since(self.started_at).as_millis() as u64,
            has_timeout: self.timeout_handle.is_some(),
        }
    }

    fn clear_timeout(&mut self) {
        if let Some(handle) = self.timeout_handle.take() {
            handle.abort();
        }
    }
}

/// Cloneable projection of a record for listings and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TestRecordInfo {
    pub test_id: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub user_id: String,
    pub project_id: String,
    pub runtime_ms: u64,
    pub has_timeout: bool,
}

/// Fields accepted when registering a test. Ownership attributes are
/// mandatory; the rest default to a fresh `running` record.
#[derive(Debug, Clone, Default)]
pub struct CreateTest {
    pub user_id: String,
    pub project_id: String,
    pub status: Option<TestStatus>,
    pub progress: Option<String>,
    pub error: Option<String>,
}

/// Partial update merged into an existing record.
#[derive(Debug, Clone, Default)]
pub struct TestUpdate {
    pub status: Option<TestStatus>,
    pub progress: Option<String>,
    pub results: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Thread-safe test registry. Cheap to clone; all clones share one map.
///
/// Constructed once at startup and handed by value to whatever needs it
/// (HTTP state, the sweeper, timeout tasks) instead of living in a global.
#[derive(Clone)]
pub struct TestRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    tests: RwLock<HashMap<String, TestRecord>>,
    broadcaster: StatusBroadcaster,
    config: RegistryConfig,
}

impl TestRegistry {
    pub fn new(config: RegistryConfig, broadcaster: StatusBroadcaster) -> Self {
        Self {
            inner: Arc::new(Inner {
                tests: RwLock::new(HashMap::new()),
                broadcaster,
                config,
            }),
        }
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.inner.broadcaster
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Register a new test. Fails fast on missing ownership attributes or a
    /// duplicate id; a failed call never leaves a partial record behind.
    pub fn create(&self, test_id: &str, opts: CreateTest) -> Result<TestRecordInfo, RegistryError> {
        if opts.user_id.is_empty() || opts.project_id.is_empty() {
            return Err(RegistryError::MissingOwner);
        }
        let status = opts.status.unwrap_or(TestStatus::Running);
        if matches!(status, TestStatus::NotFound | TestStatus::Pending) {
            return Err(RegistryError::InvalidStatus(status.as_str().to_string()));
        }

        let now = Instant::now();
        let record_info;
        {
            let mut tests = self.inner.tests.write();
            if tests.contains_key(test_id) {
                return Err(RegistryError::AlreadyExists(test_id.to_string()));
            }

            let timeout_handle = if status.is_terminal() {
                None
            } else {
                Some(self.spawn_timeout(test_id))
            };
            let record = TestRecord {
                status,
                progress: opts.progress,
                results: None,
                error: opts.error,
                started_at: now,
                user_id: opts.user_id,
                project_id: opts.project_id,
                timeout_handle,
                cancel: CancellationToken::new(),
            };
            record_info = record.info(test_id, now);
            // Published while the lock is held: snapshots must leave the
            // registry in mutation order.
            self.inner.broadcaster.publish(test_id, record.snapshot(now));
            tests.insert(test_id.to_string(), record);
        }

        info!(test_id, status = %status, "test registered");
        Ok(record_info)
    }

    pub fn get(&self, test_id: &str) -> Option<TestRecordInfo> {
        let tests = self.inner.tests.read();
        tests.get(test_id).map(|r| r.info(test_id, Instant::now()))
    }

    /// Current wire snapshot for a test, or `None` when the lookup misses.
    pub fn status_snapshot(&self, test_id: &str) -> Option<StatusSnapshot> {
        let tests = self.inner.tests.read();
        tests.get(test_id).map(|r| r.snapshot(Instant::now()))
    }

    /// Merge `update` into an existing record and publish the resulting
    /// snapshot. Returns `false` when the record is absent, already
    /// terminal, or the update tries to store a wire-only status.
    pub fn update(&self, test_id: &str, update: TestUpdate) -> bool {
        if let Some(status) = update.status {
            if matches!(status, TestStatus::NotFound | TestStatus::Pending) {
                warn!(test_id, status = %status, "refusing to store wire-only status");
                return false;
            }
        }

        let snapshot = {
            let mut tests = self.inner.tests.write();
            let Some(record) = tests.get_mut(test_id) else {
                debug!(test_id, "update failed, test not found");
                return false;
            };
            if record.status.is_terminal() {
                debug!(test_id, status = %record.status, "ignoring update to terminal test");
                return false;
            }

            if let Some(status) = update.status {
                record.status = status;
                if status.is_terminal() {
                    record.clear_timeout();
                }
            }
            if let Some(progress) = update.progress {
                record.progress = Some(progress);
            }
            if let Some(results) = update.results {
                record.results = Some(results);
            }
            if let Some(error) = update.error {
                record.error = Some(error);
            }
            let snapshot = record.snapshot(Instant::now());
            self.inner.broadcaster.publish(test_id, snapshot.clone());
            snapshot
        };

        info!(test_id, status = %snapshot.status, "test updated");
        true
    }

    /// Force a test into the `error` state with a timeout reason and signal
    /// its cancellation token. Idempotent: a second call is a no-op.
    pub fn timeout(&self, test_id: &str, reason: &str) {
        {
            let mut tests = self.inner.tests.write();
            let Some(record) = tests.get_mut(test_id) else {
                debug!(test_id, "timeout fired for unknown test");
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            record.clear_timeout();
            record.cancel.cancel();
            record.status = TestStatus::Error;
            record.error = Some(reason.to_string());
            record.progress = Some("Timed out".to_string());
            self.inner
                .broadcaster
                .publish(test_id, record.snapshot(Instant::now()));
        }

        warn!(test_id, reason, "test timed out");
    }

    /// User-initiated cancellation: signal the token and transition to
    /// `aborted`. Returns `false` when the record is absent or terminal.
    pub fn abort(&self, test_id: &str) -> bool {
        {
            let mut tests = self.inner.tests.write();
            let Some(record) = tests.get_mut(test_id) else {
                return false;
            };
            if record.status.is_terminal() {
                return false;
            }
            record.clear_timeout();
            record.cancel.cancel();
            record.status = TestStatus::Aborted;
            self.inner
                .broadcaster
                .publish(test_id, record.snapshot(Instant::now()));
        }

        info!(test_id, "test aborted");
        true
    }

    /// Remove a record, signalling cancellation to any in-flight work. Open
    /// status streams observe a terminal `not_found` snapshot.
    pub fn delete(&self, test_id: &str) -> bool {
        let remaining;
        {
            let mut tests = self.inner.tests.write();
            let Some(mut record) = tests.remove(test_id) else {
                return false;
            };
            record.clear_timeout();
            record.cancel.cancel();
            remaining = tests.len();
            self.inner
                .broadcaster
                .publish(test_id, StatusSnapshot::not_found("test no longer available"));
        }

        info!(test_id, remaining, "test deleted");
        true
    }

    /// Evict every record older than the retention window. Returns the
    /// number of records removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let retention = self.inner.config.retention;
        let stale: Vec<String> = {
            let tests = self.inner.tests.read();
            tests
                .iter()
                .filter(|(_, record)| now.duration_since(record.started_at) > retention)
                .map(|(test_id, _)| test_id.clone())
                .collect()
        };

        let mut evicted = 0;
        for test_id in stale {
            debug!(%test_id, "removing stale test");
            if self.delete(&test_id) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Clone of the record's cancellation token, for the test runner to
    /// observe while producing results.
    pub fn cancellation_token(&self, test_id: &str) -> Option<CancellationToken> {
        let tests = self.inner.tests.read();
        tests.get(test_id).map(|r| r.cancel.clone())
    }

    pub fn list(&self) -> Vec<TestRecordInfo> {
        let now = Instant::now();
        let tests = self.inner.tests.read();
        tests.iter().map(|(id, r)| r.info(id, now)).collect()
    }

    /// One-line diagnostic view of everything currently tracked.
    pub fn debug_summary(&self) -> String {
        let now = Instant::now();
        let tests = self.inner.tests.read();
        let mut parts: Vec<String> = tests
            .iter()
            .map(|(id, r)| {
                format!(
                    "{id}={} ({}s)",
                    r.status,
                    now.duration_since(r.started_at).as_secs()
                )
            })
            .collect();
        parts.sort();
        format!("{} tracked tests: [{}]", parts.len(), parts.join(", "))
    }

    pub fn len(&self) -> usize {
        self.inner.tests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tests.read().is_empty()
    }

    fn spawn_timeout(&self, test_id: &str) -> JoinHandle<()> {
        let registry = self.clone();
        let test_id = test_id.to_string();
        let max_runtime = self.inner.config.max_runtime;
        tokio::spawn(async move {
            tokio::time::sleep(max_runtime).await;
            registry.timeout(&test_id, "test timed out after maximum runtime");
        })
    }
}
