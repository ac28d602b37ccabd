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

//! Periodic eviction of stale registry records.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::TestRegistry;

/// Spawn the background sweep loop. Started once at process startup; runs
/// for the process lifetime. One iteration evicting nothing is normal, and
/// nothing a single iteration does can stop the next one.
pub fn spawn_sweeper(registry: TestRegistry, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the loop below should only
        // run after a full period has elapsed.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            debug!(registry = %registry.debug_summary(), "running scheduled registry sweep");
            let evicted = registry.sweep();
            if evicted > 0 {
                info!(evicted, remaining = registry.len(), "sweep evicted stale tests");
            }
        }
    })
}
