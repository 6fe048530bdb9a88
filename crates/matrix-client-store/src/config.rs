// Copyright 2025 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, time::Duration};

/// The default interval between two full writes of the sync snapshot.
pub const DEFAULT_WRITE_DELAY: Duration = Duration::from_secs(5 * 60);

/// The default number of timeline events kept per joined room.
pub const DEFAULT_MAX_TIMELINE_ENTRIES: usize = 50;

/// Configuration for the sync accumulator and the degradable store.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use matrix_client_store::StoreConfig;
///
/// let config = StoreConfig::new().write_delay(Duration::from_secs(30));
/// ```
#[derive(Copy, Clone)]
pub struct StoreConfig {
    pub(crate) write_delay: Duration,
    pub(crate) max_timeline_entries: usize,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for StoreConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("StoreConfig")
            .field("write_delay", &self.write_delay)
            .field("max_timeline_entries", &self.max_timeline_entries)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_delay: DEFAULT_WRITE_DELAY,
            max_timeline_entries: DEFAULT_MAX_TIMELINE_ENTRIES,
        }
    }
}

impl StoreConfig {
    /// Create a new default `StoreConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the minimum time between two writes of the sync snapshot, unless
    /// the write is forced.
    #[must_use]
    pub fn write_delay(mut self, write_delay: Duration) -> Self {
        self.write_delay = write_delay;
        self
    }

    /// Set the number of timeline events kept per joined room.
    ///
    /// The accumulator keeps at least one pagination point, so a room may
    /// temporarily hold a few more events than this.
    #[must_use]
    pub fn max_timeline_entries(mut self, max_timeline_entries: usize) -> Self {
        self.max_timeline_entries = max_timeline_entries;
        self
    }

    /// The configured write delay.
    pub fn get_write_delay(&self) -> Duration {
        self.write_delay
    }

    /// The configured number of timeline events kept per room.
    pub fn get_max_timeline_entries(&self) -> usize {
        self.max_timeline_entries
    }
}
