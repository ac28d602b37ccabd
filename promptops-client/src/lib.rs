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

//! Client side of the PromptOps status channel.
//!
//! [`ConnectionMultiplexer`] keeps at most one network stream open per
//! observed test and fans incoming payloads out to any number of listeners;
//! [`StatusProjector`] wraps a subscription in a lifecycle-aware state
//! machine that produces UI-ready [`UiStatus`] values.

pub mod multiplexer;
pub mod payload;
pub mod projector;
pub mod transport;

pub use multiplexer::{ConnectionMultiplexer, Subscription};
pub use payload::StatusPayload;
pub use projector::{project, Phase, ProjectorConfig, StatusKind, StatusProjector, UiStatus};
pub use transport::{HttpStatusTransport, StatusTransport, StreamEvent, TransportError};
