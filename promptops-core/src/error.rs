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

use thiserror::Error;

/// Precondition failures from registry operations.
///
/// These are local fail-fast errors; a failed operation never leaves a
/// partial record behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("user_id and project_id are required")]
    MissingOwner,

    #[error("test `{0}` is already registered")]
    AlreadyExists(String),

    #[error("status `{0}` cannot be stored against a test record")]
    InvalidStatus(String),
}
