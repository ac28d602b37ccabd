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

pub mod health;
pub mod status_stream;
pub mod test_runs;

use crate::registry::TestRegistry;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: TestRegistry,
}

pub use health::health_check;
pub use status_stream::stream_test_status;
pub use test_runs::{
    abort_test, delete_test, get_test, list_tests, register_test, update_test,
};
