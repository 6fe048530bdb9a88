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

//! Wall-clock helpers.
//!
//! Protocol timestamps (`origin_server_ts`, `created_ts`, `expires_ts`, key
//! creation timestamps) are milliseconds since the unix epoch and are handled
//! as plain `u64`s internally.

use ruma::MilliSecondsSinceUnixEpoch;

/// The current wall-clock time, in milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    MilliSecondsSinceUnixEpoch::now().get().into()
}

/// Convert a ruma timestamp into milliseconds since the unix epoch.
pub fn as_millis(ts: MilliSecondsSinceUnixEpoch) -> u64 {
    ts.get().into()
}

/// A source of wall-clock time.
///
/// The membership and encryption managers stamp their outgoing data with the
/// wall clock; tests substitute a [`ManualClock`].
pub trait Clock: std::fmt::Debug + Send + Sync {
    /// The current time, in milliseconds since the unix epoch.
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        now_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self { now: now.into() }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, ManualClock};

    #[test]
    fn test_manual_clock_only_moves_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);

        clock.advance(500);
        assert_eq!(clock.now_millis(), 1_500);

        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
