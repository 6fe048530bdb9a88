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

//! Rotation and distribution of the media keys of a call.
//!
//! The local device has one media key at a time. A new key is created every
//! time the participants of the call change, sent to the other participants
//! through a [`KeyTransport`], and only used locally once the others had a
//! chance to receive it. The keys of the other participants are collected in
//! a [`KeyRing`].

use std::{collections::BTreeMap, fmt, time::Duration};

use matrix_client_common::{debug::DebugSecret, AsyncTraitDeps};
use tokio::sync::broadcast;

use crate::membership::{CallMembership, ParticipantId};

mod key_ring;
mod key_transport;
mod manager;

pub use self::{
    key_ring::{KeyBuffer, KeyRing, KeyRingEntry, KeyVerdict},
    key_transport::{
        CombinedKeyTransport, KeyTransport, OutboundKey, ReceivedKey, RoomKeyTransport,
        ToDeviceKeyTransport,
    },
    manager::{EncryptionManager, RtcEncryptionManager},
};

/// Configuration of an encryption manager.
#[derive(Clone, Copy, Debug)]
pub struct EncryptionConfig {
    pub(crate) debounce: Duration,
    pub(crate) rollout_delay: Duration,
    pub(crate) key_buffer_ttl: Duration,
    pub(crate) manage_media_keys: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            rollout_delay: Duration::from_secs(5),
            key_buffer_ttl: Duration::from_secs(1),
            manage_media_keys: true,
        }
    }
}

impl EncryptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Membership changes closer to each other than this cause a single
    /// rotation.
    #[must_use]
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// How long a new key is only distributed before being used locally.
    #[must_use]
    pub fn rollout_delay(mut self, rollout_delay: Duration) -> Self {
        self.rollout_delay = rollout_delay;
        self
    }

    /// How long a received key can be overtaken by an outdated one.
    #[must_use]
    pub fn key_buffer_ttl(mut self, key_buffer_ttl: Duration) -> Self {
        self.key_buffer_ttl = key_buffer_ttl;
        self
    }

    /// Whether media keys are handled at all, calls without end-to-end
    /// encryption disable this.
    #[must_use]
    pub fn manage_media_keys(mut self, manage_media_keys: bool) -> Self {
        self.manage_media_keys = manage_media_keys;
        self
    }
}

/// A media key started being used by a participant.
#[derive(Clone, Eq, PartialEq)]
pub struct EncryptionKeyChanged {
    pub key: Vec<u8>,
    pub index: u8,
    pub participant: ParticipantId,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for EncryptionKeyChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKeyChanged")
            .field("key", &DebugSecret(&self.key))
            .field("index", &self.index)
            .field("participant", &self.participant)
            .finish()
    }
}

/// The media key handling of a call, as seen by the session.
pub trait CallEncryption: AsyncTraitDeps {
    /// Create the first key of the local device and use it right away.
    fn join(&self);

    /// Forget every key.
    fn leave(&self);

    /// Give the manager the latest memberships of the call.
    fn on_memberships_changed(&self, memberships: &[CallMembership]);

    /// Subscribe to the keys that start being used, by the local device or
    /// another participant.
    fn subscribe(&self) -> broadcast::Receiver<EncryptionKeyChanged>;

    /// A copy of the keys of every participant.
    fn key_ring_snapshot(&self) -> BTreeMap<ParticipantId, Vec<KeyRingEntry>>;

    /// The index of the key the local device currently uses.
    fn own_key_index(&self) -> Option<u8>;
}
