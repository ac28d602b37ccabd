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

//! Process-wide fan-out of test status transitions.
//!
//! Every registry mutation publishes one [`StatusEvent`]; each open status
//! stream subscribes once and filters by test id. Slow consumers lag and
//! re-sync rather than applying backpressure to the registry.

use promptops_core::StatusSnapshot;
use tokio::sync::broadcast;

/// One status transition for one test.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub test_id: String,
    pub snapshot: StatusSnapshot,
}

/// Sender half of the status channel, shared by the registry and cloned
/// into application state.
#[derive(Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Push a snapshot to every open stream for `test_id`. Send errors mean
    /// no subscriber is listening, which is normal for unobserved tests.
    pub fn publish(&self, test_id: &str, snapshot: StatusSnapshot) {
        let _ = self.tx.send(StatusEvent {
            test_id: test_id.to_string(),
            snapshot,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Number of currently subscribed receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
