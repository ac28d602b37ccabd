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

/// Lifecycle status of a tracked test.
///
/// `Pending` and `NotFound` are wire-only: the server synthesizes them for
/// tests it knows of but has not registered yet (`Pending`) or for lookups
/// that miss (`NotFound`). Neither is ever stored against a live registry
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Running,
    Processing,
    Pending,
    Completed,
    Error,
    Aborted,
    NotFound,
}

impl TestStatus {
    /// Whether no further transition is permitted from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Error | TestStatus::Aborted | TestStatus::NotFound
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Running => "running",
            TestStatus::Processing => "processing",
            TestStatus::Pending => "pending",
            TestStatus::Completed => "completed",
            TestStatus::Error => "error",
            TestStatus::Aborted => "aborted",
            TestStatus::NotFound => "not_found",
        }
    }

    /// Parse a wire status string. Unknown values return `None` so the
    /// caller can still name them in an error message.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(TestStatus::Running),
            "processing" => Some(TestStatus::Processing),
            "pending" => Some(TestStatus::Pending),
            "completed" => Some(TestStatus::Completed),
            "error" => Some(TestStatus::Error),
            "aborted" => Some(TestStatus::Aborted),
            "not_found" => Some(TestStatus::NotFound),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TestStatus::Running.is_terminal());
        assert!(!TestStatus::Processing.is_terminal());
        assert!(!TestStatus::Pending.is_terminal());
        assert!(TestStatus::Completed.is_terminal());
        assert!(TestStatus::Error.is_terminal());
        assert!(TestStatus::Aborted.is_terminal());
        assert!(TestStatus::NotFound.is_terminal());
    }

    #[test]
    fn test_wire_round_trip() {
        for status in [
            TestStatus::Running,
            TestStatus::Processing,
            TestStatus::Pending,
            TestStatus::Completed,
            TestStatus::Error,
            TestStatus::Aborted,
            TestStatus::NotFound,
        ] {
            assert_eq!(TestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TestStatus::parse("exploded"), None);
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&TestStatus::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
    }
}
