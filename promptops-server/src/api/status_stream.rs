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

//! Server-Sent Events status channel, one stream per observed test.
//!
//! On connect the current snapshot goes out immediately; afterwards every
//! registry mutation for that test id is relayed in publication order. The
//! first terminal snapshot is followed by a `close` event and the end of
//! the stream; nothing is ever emitted after that.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use futures::StreamExt;
use promptops_core::StatusSnapshot;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::AppState;
use crate::registry::TestRegistry;

/// One frame of the status channel, before SSE encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusFrame {
    Status(StatusSnapshot),
    Close,
}

/// GET /api/v1/projects/:project_id/tests/:test_id/events
pub async fn stream_test_status(
    State(state): State<AppState>,
    Path((project_id, test_id)): Path<(String, String)>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(%project_id, %test_id, "status stream requested");

    let stream = status_frames(state.registry.clone(), project_id, test_id).map(|frame| {
        Ok(match frame {
            StatusFrame::Status(snapshot) => Event::default().event("status").data(
                serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string()),
            ),
            StatusFrame::Close => Event::default().event("close").data("{}"),
        })
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// The frame sequence for one `(project, test)` observer.
///
/// A missing record, or a record owned by a different project, produces a
/// terminal `not_found` snapshot; the registry never gains a record for it.
pub fn status_frames(
    registry: TestRegistry,
    project_id: String,
    test_id: String,
) -> impl Stream<Item = StatusFrame> {
    async_stream::stream! {
        // Subscribe before reading the initial snapshot so a transition
        // landing between the two is never lost.
        let mut rx = registry.broadcaster().subscribe();

        let initial = match registry.get(&test_id) {
            Some(info) if info.project_id == project_id => registry.status_snapshot(&test_id),
            _ => None,
        };

        match initial {
            None => {
                yield StatusFrame::Status(StatusSnapshot::not_found(
                    "test not found or has expired",
                ));
                yield StatusFrame::Close;
                return;
            }
            Some(snapshot) => {
                let terminal = snapshot.is_terminal();
                yield StatusFrame::Status(snapshot);
                if terminal {
                    yield StatusFrame::Close;
                    return;
                }
            }
        }

        loop {
            match rx.recv().await {
                Ok(event) if event.test_id == test_id => {
                    let terminal = event.snapshot.is_terminal();
                    yield StatusFrame::Status(event.snapshot);
                    if terminal {
                        yield StatusFrame::Close;
                        break;
                    }
                }
                Ok(_) => {} // Different test.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%test_id, skipped, "status stream lagged, re-syncing");
                    match registry.status_snapshot(&test_id) {
                        Some(snapshot) => {
                            let terminal = snapshot.is_terminal();
                            yield StatusFrame::Status(snapshot);
                            if terminal {
                                yield StatusFrame::Close;
                                break;
                            }
                        }
                        None => {
                            yield StatusFrame::Status(StatusSnapshot::not_found(
                                "test no longer available",
                            ));
                            yield StatusFrame::Close;
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
