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

use promptops_core::TestStatus;
use serde::{Deserialize, Serialize};

/// The client's view of a status payload.
///
/// `status` stays a raw string here: a server emitting a value outside the
/// known set must not break deserialization, and the offending value has to
/// survive long enough to be named in an error message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<u64>,
}

impl StatusPayload {
    /// The status parsed into the known set, if it is in the known set.
    pub fn parsed_status(&self) -> Option<TestStatus> {
        self.status.as_deref().and_then(TestStatus::parse)
    }

    /// Whether this payload carries one of the four terminal statuses.
    /// Unknown status strings are not treated as terminal here; closing the
    /// stream on them is a display-policy decision, not a transport one.
    pub fn is_terminal(&self) -> bool {
        self.parsed_status().map_or(false, |s| s.is_terminal())
    }

    /// Synthetic payload delivered when the stream itself fails.
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}
