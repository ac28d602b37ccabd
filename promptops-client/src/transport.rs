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

//! Network transport behind the connection multiplexer.
//!
//! The multiplexer only ever sees a stream of [`StreamEvent`]s, so tests
//! inject an in-memory transport while production uses
//! [`HttpStatusTransport`] speaking SSE over reqwest.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tracing::warn;

use crate::payload::StatusPayload;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("stream failed: {0}")]
    Stream(String),
}

/// Decoded event from the status channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Status(StatusPayload),
    /// Server-initiated end of the stream.
    Close,
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, TransportError>>;

/// Opens one long-lived status stream per call.
#[async_trait]
pub trait StatusTransport: Send + Sync + 'static {
    async fn open(&self, project_id: &str, test_id: &str) -> Result<EventStream, TransportError>;
}

// ============================================================================
// SSE wire decoding
// ============================================================================

/// A complete SSE frame: event name plus joined data lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bytes. Chunk boundaries are
/// arbitrary; feed whatever arrives and collect the frames that completed.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseFrameDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.take_frame() {
                    frames.push(frame);
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            } else if line.starts_with(':') {
                // Comment line, typically a keep-alive. Ignore.
            }
            // id:/retry: fields are not used by this protocol.
        }
        frames
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        let frame = SseFrame {
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(frame)
    }
}

// ============================================================================
// HTTP transport
// ============================================================================

/// Production transport: GET the per-test events endpoint and decode the
/// SSE stream.
pub struct HttpStatusTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpStatusTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn stream_url(&self, project_id: &str, test_id: &str) -> String {
        format!(
            "{}/api/v1/projects/{}/tests/{}/events",
            self.base_url.trim_end_matches('/'),
            project_id,
            test_id
        )
    }
}

#[async_trait]
impl StatusTransport for HttpStatusTransport {
    async fn open(&self, project_id: &str, test_id: &str) -> Result<EventStream, TransportError> {
        let url = self.stream_url(project_id, test_id);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Connect(format!(
                "server returned {}",
                response.status()
            )));
        }

        let stream = async_stream::stream! {
            let mut decoder = SseFrameDecoder::default();
            let mut bytes = response.bytes_stream();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(TransportError::Stream(err.to_string()));
                        return;
                    }
                };
                for frame in decoder.feed(&chunk) {
                    match frame.event.as_str() {
                        "status" => match serde_json::from_str::<StatusPayload>(&frame.data) {
                            Ok(payload) => yield Ok(StreamEvent::Status(payload)),
                            Err(err) => {
                                warn!(%err, "dropping undecodable status frame");
                            }
                        },
                        "close" => {
                            yield Ok(StreamEvent::Close);
                            return;
                        }
                        _ => {} // heartbeat and friends
                    }
                }
            }
            // Stream ended without an explicit close event.
            yield Ok(StreamEvent::Close);
        };

        Ok(stream.boxed())
    }
}
