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

use serde::{Deserialize, Serialize};

use crate::TestStatus;

/// Point-in-time projection of a test record, suitable for transmission.
///
/// This is the JSON body of every `status` event on the server's status
/// channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<u64>,
}

impl StatusSnapshot {
    /// Terminal snapshot for a test id the registry has no record of.
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self {
            status: TestStatus::NotFound,
            progress: None,
            results: None,
            error: Some(reason.into()),
            runtime_seconds: None,
        }
    }

    /// Snapshot for a test that is known of but not yet registered.
    pub fn pending(progress: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Pending,
            progress: Some(progress.into()),
            results: None,
            error: None,
            runtime_seconds: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
