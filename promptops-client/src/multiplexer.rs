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

//! Deduplicating manager for status-channel connections.
//!
//! Several UI surfaces may observe the same test; all of them share one
//! underlying network stream. An entry lives from the first subscription
//! for a `(project, test)` pair until the last listener detaches, a
//! terminal payload arrives, or the stream itself ends.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::payload::StatusPayload;
use crate::transport::{StatusTransport, StreamEvent};
use futures::StreamExt;

pub type StatusListener = Arc<dyn Fn(StatusPayload) + Send + Sync>;

struct Entry {
    listeners: HashMap<String, StatusListener>,
    last_payload: Option<StatusPayload>,
    // Reader task owning the network stream; exactly one per entry.
    reader: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn StatusTransport>,
    connections: Mutex<HashMap<String, Entry>>,
    results_cache: Mutex<HashMap<String, serde_json::Value>>,
}

/// Per-process connection manager. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionMultiplexer {
    inner: Arc<Inner>,
}

/// Handle for one registered listener. Unsubscribing (or dropping) removes
/// the listener; emptying an entry's listener map closes its stream.
#[must_use = "dropping the subscription detaches the listener"]
pub struct Subscription {
    inner: Weak<Inner>,
    key: Option<String>,
    listener_id: String,
}

fn connection_key(project_id: &str, test_id: &str) -> String {
    format!("{project_id}:{test_id}")
}

impl ConnectionMultiplexer {
    pub fn new(transport: Arc<dyn StatusTransport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                connections: Mutex::new(HashMap::new()),
                results_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to status updates for a test.
    ///
    /// The first subscriber for a `(project, test)` pair opens the network
    /// stream; later subscribers share it and immediately receive the most
    /// recent payload (asynchronously, to the new callback only) when one
    /// is cached.
    pub fn subscribe(
        &self,
        project_id: &str,
        test_id: &str,
        listener_id: &str,
        callback: impl Fn(StatusPayload) + Send + Sync + 'static,
    ) -> Subscription {
        if project_id.is_empty() || test_id.is_empty() {
            return Subscription {
                inner: Weak::new(),
                key: None,
                listener_id: listener_id.to_string(),
            };
        }

        let key = connection_key(project_id, test_id);
        let callback: StatusListener = Arc::new(callback);

        let mut connections = self.inner.connections.lock();
        match connections.get_mut(&key) {
            Some(entry) => {
                entry.listeners.insert(listener_id.to_string(), callback.clone());

                // Replay cached data so the UI renders without waiting on
                // the network. Asynchronous, and only to this listener.
                if let Some(payload) = entry.last_payload.clone() {
                    tokio::spawn(async move {
                        callback(payload);
                    });
                }
            }
            None => {
                info!(test_id, "creating new status connection");
                let mut listeners = HashMap::new();
                listeners.insert(listener_id.to_string(), callback);
                let reader = tokio::spawn(run_stream(
                    Arc::downgrade(&self.inner),
                    key.clone(),
                    project_id.to_string(),
                    test_id.to_string(),
                ));
                connections.insert(
                    key.clone(),
                    Entry {
                        listeners,
                        last_payload: None,
                        reader: Some(reader),
                    },
                );
            }
        }
        drop(connections);

        Subscription {
            inner: Arc::downgrade(&self.inner),
            key: Some(key),
            listener_id: listener_id.to_string(),
        }
    }

    /// Most recent `results` payload seen for a test, if any.
    pub fn cached_results(&self, test_id: &str) -> Option<serde_json::Value> {
        self.inner.results_cache.lock().get(test_id).cloned()
    }

    /// Number of currently open entries (and therefore network streams).
    pub fn active_connections(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Close every connection, e.g. on sign-out.
    pub fn close_all(&self) {
        info!("closing all status connections");
        let entries: Vec<Entry> = {
            let mut connections = self.inner.connections.lock();
            connections.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(reader) = entry.reader {
                reader.abort();
            }
        }
    }
}

impl Inner {
    /// Remove an entry and stop its reader. Idempotent.
    fn remove_entry(&self, key: &str) {
        let entry = self.connections.lock().remove(key);
        if let Some(entry) = entry {
            debug!(key, "closing status connection");
            if let Some(reader) = entry.reader {
                reader.abort();
            }
        }
    }

    /// Deliver `payload` to every listener of `key`, then tear the entry
    /// down when it is terminal. Callbacks run without the map lock held.
    fn dispatch(&self, key: &str, payload: StatusPayload) {
        let listeners: Vec<StatusListener> = {
            let mut connections = self.connections.lock();
            let Some(entry) = connections.get_mut(key) else {
                return;
            };
            entry.last_payload = Some(payload.clone());
            entry.listeners.values().cloned().collect()
        };

        for listener in listeners {
            listener(payload.clone());
        }

        if payload.is_terminal() {
            debug!(key, "terminal state reached");
            self.remove_entry(key);
        }
    }

    /// Stream-level failure: notify every listener once with a generic
    /// connection error, then tear down. Nothing fires afterwards.
    fn fail_entry(&self, key: &str) {
        let listeners: Vec<StatusListener> = {
            let connections = self.connections.lock();
            match connections.get(key) {
                Some(entry) => entry.listeners.values().cloned().collect(),
                None => return,
            }
        };

        let payload = StatusPayload::connection_error("connection error");
        for listener in listeners {
            listener(payload.clone());
        }
        self.remove_entry(key);
    }
}

/// Reader task: owns the network stream for one entry and feeds the fan-out.
async fn run_stream(inner: Weak<Inner>, key: String, project_id: String, test_id: String) {
    let transport = match inner.upgrade() {
        Some(strong) => strong.transport.clone(),
        None => return,
    };

    let mut stream = match transport.open(&project_id, &test_id).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(%test_id, %err, "failed to open status stream");
            if let Some(inner) = inner.upgrade() {
                inner.fail_entry(&key);
            }
            return;
        }
    };

    while let Some(event) = stream.next().await {
        let Some(strong) = inner.upgrade() else { return };
        match event {
            Ok(StreamEvent::Status(payload)) => {
                debug!(%test_id, status = ?payload.status, "status update");
                if let Some(results) = payload.results.clone() {
                    strong
                        .results_cache
                        .lock()
                        .insert(test_id.clone(), results);
                }
                strong.dispatch(&key, payload);
            }
            Ok(StreamEvent::Close) => {
                info!(%test_id, "server closed status stream");
                strong.remove_entry(&key);
                return;
            }
            Err(err) => {
                warn!(%test_id, %err, "status stream error");
                strong.fail_entry(&key);
                return;
            }
        }
    }

    // Transport ran dry without a close event.
    if let Some(strong) = inner.upgrade() {
        strong.remove_entry(&key);
    }
}

impl Subscription {
    /// Detach this listener. When it was the entry's last listener, the
    /// entry and its network stream are torn down.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        let Some(key) = self.key.take() else { return };
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let teardown = {
            let mut connections = inner.connections.lock();
            match connections.get_mut(&key) {
                Some(entry) => {
                    entry.listeners.remove(&self.listener_id);
                    entry.listeners.is_empty()
                }
                None => false,
            }
        };
        if teardown {
            inner.remove_entry(&key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;
    use crate::transport::TransportError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collector() -> (
        StatusListener,
        mpsc::UnboundedReceiver<StatusPayload>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: StatusListener = Arc::new(move |payload| {
            let _ = tx.send(payload);
        });
        (listener, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<StatusPayload>) -> StatusPayload {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for payload")
            .expect("channel closed")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn running(progress: &str) -> StatusPayload {
        StatusPayload {
            status: Some("processing".to_string()),
            progress: Some(progress.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_two_subscribers_share_one_stream() {
        let transport = MockTransport::new();
        let mux = ConnectionMultiplexer::new(transport.clone());

        let (listener_a, mut rx_a) = collector();
        let (listener_b, mut rx_b) = collector();
        let sub_a = mux.subscribe("p1", "t3", "listener-a", move |p| listener_a(p));
        let sub_b = mux.subscribe("p1", "t3", "listener-b", move |p| listener_b(p));
        settle().await;

        assert_eq!(transport.open_count(), 1);
        assert_eq!(mux.active_connections(), 1);

        // One server event, both callbacks fire once with identical content.
        transport.push_status(running("50%"));
        let got_a = recv(&mut rx_a).await;
        let got_b = recv(&mut rx_b).await;
        assert_eq!(got_a, got_b);
        assert_eq!(got_a.progress.as_deref(), Some("50%"));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        // Unsubscribing one leaves the other receiving.
        sub_a.unsubscribe();
        settle().await;
        transport.push_status(running("75%"));
        let got_b = recv(&mut rx_b).await;
        assert_eq!(got_b.progress.as_deref(), Some("75%"));
        assert!(rx_a.try_recv().is_err());

        // Unsubscribing the last listener tears the stream down.
        sub_b.unsubscribe();
        settle().await;
        assert_eq!(mux.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_cached_payload() {
        let transport = MockTransport::new();
        let mux = ConnectionMultiplexer::new(transport.clone());

        let (listener_a, mut rx_a) = collector();
        let _sub_a = mux.subscribe("p1", "t1", "listener-a", move |p| listener_a(p));
        settle().await;
        transport.push_status(running("30%"));
        let first = recv(&mut rx_a).await;
        assert_eq!(first.progress.as_deref(), Some("30%"));

        // B joins after the payload was cached: B gets the replay, A does
        // not see a duplicate.
        let (listener_b, mut rx_b) = collector();
        let _sub_b = mux.subscribe("p1", "t1", "listener-b", move |p| listener_b(p));
        let replayed = recv(&mut rx_b).await;
        assert_eq!(replayed, first);
        settle().await;
        assert!(rx_a.try_recv().is_err());
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_terminal_payload_tears_down_after_delivery() {
        let transport = MockTransport::new();
        let mux = ConnectionMultiplexer::new(transport.clone());

        let (listener, mut rx) = collector();
        let sub = mux.subscribe("p1", "t1", "listener-a", move |p| listener(p));
        settle().await;

        transport.push_status(StatusPayload {
            status: Some("completed".to_string()),
            results: Some(serde_json::json!({"score": 0.9})),
            ..Default::default()
        });

        let payload = recv(&mut rx).await;
        assert_eq!(payload.status.as_deref(), Some("completed"));
        settle().await;
        assert_eq!(mux.active_connections(), 0);
        assert_eq!(
            mux.cached_results("t1"),
            Some(serde_json::json!({"score": 0.9}))
        );

        // Exactly once, and unsubscribing afterwards is not an error.
        assert!(rx.try_recv().is_err());
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn test_stream_error_notifies_then_tears_down() {
        let transport = MockTransport::new();
        let mux = ConnectionMultiplexer::new(transport.clone());

        let (listener, mut rx) = collector();
        let _sub = mux.subscribe("p1", "t1", "listener-a", move |p| listener(p));
        settle().await;

        transport.push(Err(TransportError::Stream("reset by peer".to_string())));
        let payload = recv(&mut rx).await;
        assert_eq!(payload.status, None);
        assert_eq!(payload.error.as_deref(), Some("connection error"));
        settle().await;
        assert_eq!(mux.active_connections(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_notifies_listeners() {
        let transport = MockTransport::failing();
        let mux = ConnectionMultiplexer::new(transport.clone());

        let (listener, mut rx) = collector();
        let _sub = mux.subscribe("p1", "t1", "listener-a", move |p| listener(p));

        let payload = recv(&mut rx).await;
        assert_eq!(payload.error.as_deref(), Some("connection error"));
        settle().await;
        assert_eq!(mux.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_server_close_tears_down_silently() {
        let transport = MockTransport::new();
        let mux = ConnectionMultiplexer::new(transport.clone());

        let (listener, mut rx) = collector();
        let _sub = mux.subscribe("p1", "t1", "listener-a", move |p| listener(p));
        settle().await;

        transport.push(Ok(StreamEvent::Close));
        settle().await;
        assert_eq!(mux.active_connections(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_ids_subscribe_is_inert() {
        let transport = MockTransport::new();
        let mux = ConnectionMultiplexer::new(transport.clone());

        let (listener, _rx) = collector();
        let sub = mux.subscribe("", "", "listener-a", move |p| listener(p));
        assert_eq!(transport.open_count(), 0);
        assert_eq!(mux.active_connections(), 0);
        sub.unsubscribe();
    }
}
