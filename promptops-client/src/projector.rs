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

//! Lifecycle-aware projection of raw status payloads into UI state.
//!
//! A [`StatusProjector`] instance stands in for one mounted UI surface. It
//! waits out a short debounce before subscribing (near-instant tests never
//! flash a "connecting" indicator), maps every payload into a closed
//! [`StatusKind`] model, and holds a short grace period after a terminal
//! status so the final indicator is visually committed before teardown.
//! Every asynchronous continuation is guarded by a generation counter and
//! an alive flag: once the instance has declared itself no longer
//! interested, its sink is never invoked again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::multiplexer::{ConnectionMultiplexer, Subscription};
use crate::payload::StatusPayload;

/// Closed status model consumed by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Connecting,
    Connected,
    Pending,
    Completed,
    Error,
    Aborted,
    NotFound,
}

impl StatusKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusKind::Completed | StatusKind::Error | StatusKind::Aborted | StatusKind::NotFound
        )
    }
}

/// One rendered status update: kind, human message, and whatever detail the
/// payload carried.
#[derive(Debug, Clone, PartialEq)]
pub struct UiStatus {
    pub kind: StatusKind,
    pub message: String,
    pub progress: Option<String>,
    pub error: Option<String>,
    pub results: Option<serde_json::Value>,
    pub runtime_seconds: Option<u64>,
    pub raw_status: Option<String>,
}

impl UiStatus {
    fn bare(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            progress: None,
            error: None,
            results: None,
            runtime_seconds: None,
            raw_status: None,
        }
    }
}

/// Map a raw payload (or its absence) into UI state.
///
/// The unknown-status arm keeps the client from ever crashing on a server
/// emitting outside the known set; the offending value is named in the
/// message.
pub fn project(test_id: Option<&str>, payload: Option<&StatusPayload>) -> UiStatus {
    if test_id.map_or(true, str::is_empty) {
        return UiStatus::bare(StatusKind::Error, "No test ID provided");
    }

    let Some(payload) = payload else {
        return UiStatus::bare(StatusKind::Connecting, "Connecting to test server...");
    };

    let Some(raw) = payload.status.clone() else {
        // A payload with no status at all: either the stream failed before
        // delivering one, or we are still waiting on the first push.
        if let Some(error) = &payload.error {
            let mut ui = UiStatus::bare(StatusKind::Error, "Connection error");
            ui.error = Some(error.clone());
            return ui;
        }
        return UiStatus::bare(StatusKind::Connecting, "Waiting for status update...");
    };

    let (kind, message) = match raw.as_str() {
        "running" | "processing" => (StatusKind::Connected, "Test in progress".to_string()),
        "pending" => (
            StatusKind::Pending,
            "Test initialization in progress".to_string(),
        ),
        "completed" => (
            StatusKind::Completed,
            "Test completed successfully".to_string(),
        ),
        "error" => (StatusKind::Error, "Test failed with error".to_string()),
        "aborted" => (StatusKind::Aborted, "Test was aborted".to_string()),
        "not_found" => (StatusKind::NotFound, "Test not found".to_string()),
        other => (StatusKind::Error, format!("Unknown test status: {other}")),
    };

    UiStatus {
        kind,
        message,
        progress: payload.progress.clone(),
        error: payload.error.clone(),
        results: payload.results.clone(),
        runtime_seconds: payload.runtime_seconds,
        raw_status: Some(raw),
    }
}

/// The two purely cosmetic timers of the projector. Distinct from (and much
/// shorter than) the server-side runtime ceiling.
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// How long a test id must stay of interest before a subscription is
    /// opened.
    pub debounce: Duration,
    /// How long the terminal indicator is left standing before teardown.
    pub grace: Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            grace: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Armed,
    Subscribed,
}

type StatusSink = Arc<dyn Fn(UiStatus) + Send + Sync>;

struct ProjectorState {
    phase: Phase,
    test_id: Option<String>,
    active: bool,
    generation: u64,
    subscription: Option<Subscription>,
}

struct ProjectorInner {
    mux: ConnectionMultiplexer,
    project_id: String,
    config: ProjectorConfig,
    on_status: StatusSink,
    alive: AtomicBool,
    state: Mutex<ProjectorState>,
}

/// Per-surface status observer over a shared [`ConnectionMultiplexer`].
pub struct StatusProjector {
    inner: Arc<ProjectorInner>,
}

impl StatusProjector {
    pub fn new(
        mux: ConnectionMultiplexer,
        project_id: impl Into<String>,
        config: ProjectorConfig,
        on_status: impl Fn(UiStatus) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(ProjectorInner {
                mux,
                project_id: project_id.into(),
                config,
                on_status: Arc::new(on_status),
                alive: AtomicBool::new(true),
                state: Mutex::new(ProjectorState {
                    phase: Phase::Idle,
                    test_id: None,
                    active: true,
                    generation: 0,
                    subscription: None,
                }),
            }),
        }
    }

    /// Point the projector at a (possibly different) test. A change resets
    /// any in-flight subscription and re-arms for the new id; `None`
    /// quietly returns to idle.
    pub fn set_test(&self, test_id: Option<String>) {
        let mut state = self.inner.state.lock();
        if state.test_id == test_id {
            return;
        }
        state.generation += 1;
        state.subscription = None;
        state.phase = Phase::Idle;
        state.test_id = test_id;
        ProjectorInner::maybe_arm(&self.inner, &mut state);
    }

    /// Flip whether this surface is interested at all.
    pub fn set_active(&self, active: bool) {
        let mut state = self.inner.state.lock();
        if state.active == active {
            return;
        }
        state.active = active;
        if active {
            ProjectorInner::maybe_arm(&self.inner, &mut state);
        } else {
            state.generation += 1;
            state.subscription = None;
            state.phase = Phase::Idle;
        }
    }

    /// The unmount path: after this returns the sink is never invoked
    /// again, regardless of pending timers or in-flight payloads.
    pub fn shutdown(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.subscription = None;
        state.phase = Phase::Idle;
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }
}

impl ProjectorInner {
    fn maybe_arm(this: &Arc<Self>, state: &mut ProjectorState) {
        if !this.alive.load(Ordering::SeqCst) || !state.active || state.phase != Phase::Idle {
            return;
        }
        if state.test_id.is_none() {
            return;
        }

        state.phase = Phase::Armed;
        let generation = state.generation;
        let debounce = this.config.debounce;
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                ProjectorInner::arm_elapsed(&inner, generation);
            }
        });
    }

    fn arm_elapsed(this: &Arc<Self>, generation: u64) {
        let mut state = this.state.lock();
        if !this.alive.load(Ordering::SeqCst)
            || state.generation != generation
            || state.phase != Phase::Armed
            || !state.active
        {
            return;
        }
        let Some(test_id) = state.test_id.clone() else {
            return;
        };

        let listener_id = format!("listener-{}", Uuid::new_v4().simple());
        let weak = Arc::downgrade(this);
        let callback_test_id = test_id.clone();
        let subscription = this.mux.subscribe(
            &this.project_id,
            &test_id,
            &listener_id,
            move |payload| {
                if let Some(inner) = weak.upgrade() {
                    ProjectorInner::on_payload(&inner, generation, &callback_test_id, payload);
                }
            },
        );
        state.subscription = Some(subscription);
        state.phase = Phase::Subscribed;
        drop(state);

        // Stream open, nothing received yet.
        Self::emit(this, project(Some(&test_id), None));
    }

    fn on_payload(this: &Arc<Self>, generation: u64, test_id: &str, payload: StatusPayload) {
        {
            let state = this.state.lock();
            if state.generation != generation {
                return;
            }
        }

        let ui = project(Some(test_id), Some(&payload));
        let terminal = ui.kind.is_terminal();
        Self::emit(this, ui);

        if terminal {
            let grace = this.config.grace;
            let weak = Arc::downgrade(this);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(inner) = weak.upgrade() {
                    ProjectorInner::grace_elapsed(&inner, generation);
                }
            });
        }
    }

    fn grace_elapsed(this: &Arc<Self>, generation: u64) {
        let mut state = this.state.lock();
        if state.generation != generation {
            return;
        }
        state.generation += 1;
        state.subscription = None;
        state.phase = Phase::Idle;
    }

    fn emit(this: &Arc<Self>, ui: UiStatus) {
        if !this.alive.load(Ordering::SeqCst) {
            return;
        }
        (this.on_status)(ui);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;
    use tokio::sync::mpsc;

    fn setup(
        config: ProjectorConfig,
    ) -> (
        Arc<MockTransport>,
        ConnectionMultiplexer,
        StatusProjector,
        mpsc::UnboundedReceiver<UiStatus>,
    ) {
        let transport = MockTransport::new();
        let mux = ConnectionMultiplexer::new(transport.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let projector = StatusProjector::new(mux.clone(), "p1", config, move |ui| {
            let _ = tx.send(ui);
        });
        (transport, mux, projector, rx)
    }

    fn sub_second_config() -> ProjectorConfig {
        ProjectorConfig::default()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<UiStatus>) -> UiStatus {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for UI status")
            .expect("sink channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_defers_subscription() {
        let (transport, _mux, projector, _rx) = setup(sub_second_config());
        projector.set_test(Some("t1".to_string()));
        assert_eq!(projector.phase(), Phase::Armed);
        // Let the debounce timer register before moving the clock.
        settle().await;

        tokio::time::advance(Duration::from_millis(499)).await;
        settle().await;
        assert_eq!(projector.phase(), Phase::Armed);
        assert_eq!(transport.open_count(), 0);

        tokio::time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(projector.phase(), Phase::Subscribed);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_before_debounce_never_subscribes() {
        let (transport, _mux, projector, mut rx) = setup(sub_second_config());
        projector.set_test(Some("t1".to_string()));
        settle().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        projector.set_test(None);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(projector.phase(), Phase::Idle);
        assert_eq!(transport.open_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_projects_running_payload() {
        let (transport, _mux, projector, mut rx) = setup(sub_second_config());
        projector.set_test(Some("t1".to_string()));
        settle().await;
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;

        let connecting = recv(&mut rx).await;
        assert_eq!(connecting.kind, StatusKind::Connecting);

        transport.push_status(StatusPayload {
            status: Some("processing".to_string()),
            progress: Some("50%".to_string()),
            runtime_seconds: Some(3),
            ..Default::default()
        });

        let connected = recv(&mut rx).await;
        assert_eq!(connected.kind, StatusKind::Connected);
        assert_eq!(connected.message, "Test in progress");
        assert_eq!(connected.progress.as_deref(), Some("50%"));
        assert_eq!(connected.runtime_seconds, Some(3));
        assert_eq!(connected.raw_status.as_deref(), Some("processing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_then_grace_teardown() {
        let (transport, mux, projector, mut rx) = setup(sub_second_config());
        projector.set_test(Some("t1".to_string()));
        settle().await;
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        let _connecting = recv(&mut rx).await;

        transport.push_status(StatusPayload {
            status: Some("completed".to_string()),
            results: Some(serde_json::json!({"score": 0.9})),
            ..Default::default()
        });
        let completed = recv(&mut rx).await;
        assert_eq!(completed.kind, StatusKind::Completed);
        assert!(completed.kind.is_terminal());

        // The terminal toast stays up for the grace period, then the
        // instance returns to idle.
        settle().await;
        assert_eq!(projector.phase(), Phase::Subscribed);
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        assert_eq!(projector.phase(), Phase::Idle);
        assert_eq!(mux.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_status_projects_error() {
        let (transport, _mux, projector, mut rx) = setup(sub_second_config());
        projector.set_test(Some("t1".to_string()));
        settle().await;
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        let _connecting = recv(&mut rx).await;

        transport.push_status(StatusPayload {
            status: Some("exploded".to_string()),
            ..Default::default()
        });
        let ui = recv(&mut rx).await;
        assert_eq!(ui.kind, StatusKind::Error);
        assert!(ui.message.contains("exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sink_calls_after_shutdown() {
        let (transport, mux, projector, mut rx) = setup(sub_second_config());
        // A second listener keeps the entry alive after the projector
        // lets go of its subscription.
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        let _other = mux.subscribe("p1", "t1", "bystander", move |p| {
            let _ = other_tx.send(p);
        });

        projector.set_test(Some("t1".to_string()));
        settle().await;
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        let _connecting = recv(&mut rx).await;

        projector.shutdown();
        settle().await;

        transport.push_status(StatusPayload {
            status: Some("processing".to_string()),
            ..Default::default()
        });
        // The bystander still hears the update; the shut-down projector
        // stays silent.
        tokio::time::timeout(Duration::from_secs(5), other_rx.recv())
            .await
            .unwrap()
            .unwrap();
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_project_without_test_id() {
        let ui = project(None, None);
        assert_eq!(ui.kind, StatusKind::Error);
        assert_eq!(ui.message, "No test ID provided");

        let ui = project(Some(""), None);
        assert_eq!(ui.kind, StatusKind::Error);
    }

    #[test]
    fn test_project_transport_error_payload() {
        let payload = StatusPayload::connection_error("connection error");
        let ui = project(Some("t1"), Some(&payload));
        assert_eq!(ui.kind, StatusKind::Error);
        assert_eq!(ui.message, "Connection error");
        assert_eq!(ui.error.as_deref(), Some("connection error"));
    }

    #[test]
    fn test_project_mapping_table() {
        let cases = [
            ("running", StatusKind::Connected),
            ("processing", StatusKind::Connected),
            ("pending", StatusKind::Pending),
            ("completed", StatusKind::Completed),
            ("error", StatusKind::Error),
            ("aborted", StatusKind::Aborted),
            ("not_found", StatusKind::NotFound),
        ];
        for (raw, kind) in cases {
            let payload = StatusPayload {
                status: Some(raw.to_string()),
                ..Default::default()
            };
            let ui = project(Some("t1"), Some(&payload));
            assert_eq!(ui.kind, kind, "status {raw}");
            assert_eq!(ui.raw_status.as_deref(), Some(raw));
        }
    }
}
