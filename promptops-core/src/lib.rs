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

//! Shared domain types for the PromptOps test-tracking core.
//!
//! Both halves of the system speak in terms of these types: the server
//! registry stores a [`TestStatus`] per test and emits [`StatusSnapshot`]
//! payloads over its status channel; the client decodes those payloads and
//! projects them into UI state.

mod error;
mod snapshot;
mod status;

pub use error::RegistryError;
pub use snapshot::StatusSnapshot;
pub use status::TestStatus;
