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

use std::time::Duration;

/// Timings and retry limits of a [`MembershipManager`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use matrix_client_rtc::MembershipConfig;
///
/// let config = MembershipConfig::new()
///     .delayed_leave_delay(Duration::from_secs(20))
///     .delayed_leave_restart(Duration::from_secs(10));
/// ```
///
/// [`MembershipManager`]: super::MembershipManager
#[derive(Clone, Copy, Debug)]
pub struct MembershipConfig {
    pub(crate) membership_expiry: Duration,
    pub(crate) expiry_headroom: Duration,
    pub(crate) delayed_leave_delay: Duration,
    pub(crate) delayed_leave_restart: Duration,
    pub(crate) network_error_retry: Duration,
    pub(crate) maximum_rate_limit_retry_count: u32,
    pub(crate) maximum_network_error_retry_count: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            membership_expiry: Duration::from_secs(4 * 60 * 60),
            expiry_headroom: Duration::from_secs(5),
            delayed_leave_delay: Duration::from_secs(8),
            delayed_leave_restart: Duration::from_secs(5),
            network_error_retry: Duration::from_secs(3),
            maximum_rate_limit_retry_count: 10,
            maximum_network_error_retry_count: 10,
        }
    }
}

impl MembershipConfig {
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Set how long a published membership is valid, it is extended shortly
    /// before it runs out.
    #[must_use]
    pub fn membership_expiry(mut self, membership_expiry: Duration) -> Self {
        self.membership_expiry = membership_expiry;
        self
    }

    /// Set how long before its expiry a membership is extended.
    #[must_use]
    pub fn expiry_headroom(mut self, expiry_headroom: Duration) -> Self {
        self.expiry_headroom = expiry_headroom;
        self
    }

    /// Set after how long the server publishes the leave event if the lease
    /// isn't restarted.
    #[must_use]
    pub fn delayed_leave_delay(mut self, delayed_leave_delay: Duration) -> Self {
        self.delayed_leave_delay = delayed_leave_delay;
        self
    }

    /// Set the interval between two restarts of the lease.
    ///
    /// This must be shorter than the delay of the lease.
    #[must_use]
    pub fn delayed_leave_restart(mut self, delayed_leave_restart: Duration) -> Self {
        self.delayed_leave_restart = delayed_leave_restart;
        self
    }

    /// Set how long to wait before retrying after a network or server error.
    #[must_use]
    pub fn network_error_retry(mut self, network_error_retry: Duration) -> Self {
        self.network_error_retry = network_error_retry;
        self
    }

    #[must_use]
    pub fn maximum_rate_limit_retry_count(mut self, count: u32) -> Self {
        self.maximum_rate_limit_retry_count = count;
        self
    }

    #[must_use]
    pub fn maximum_network_error_retry_count(mut self, count: u32) -> Self {
        self.maximum_network_error_retry_count = count;
        self
    }
}
