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

//! The call of a room, as seen through the memberships of its devices.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use matrix_client_common::{
    executor::{spawn, AbortOnDrop, JoinHandleExt},
    sleep::sleep,
    time::Clock,
};
use ruma::{OwnedRoomId, OwnedUserId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace, warn};

use crate::{
    encryption::{
        CallEncryption, CombinedKeyTransport, EncryptionConfig, EncryptionKeyChanged,
        EncryptionManager, KeyTransport, RoomKeyTransport, RtcEncryptionManager,
        ToDeviceKeyTransport,
    },
    membership::{
        call_memberships_from_state_event, ActiveFocus, CallMembership, Focus, MembershipSource,
        ParticipantId, OLDEST_MEMBERSHIP_FOCUS_SELECTION,
    },
    membership_manager::{MembershipConfig, MembershipManager},
    transport::{RtcTransport, CALL_MEMBER_EVENT_TYPE},
};

/// Which call of a room a session is about.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SessionConfig {
    pub application: String,
    pub call_id: String,
    pub scope: String,
}

impl Default for SessionConfig {
    /// The room call: `m.call` with an empty call ID, scoped to the room.
    fn default() -> Self {
        Self { application: "m.call".to_owned(), call_id: String::new(), scope: "m.room".to_owned() }
    }
}

impl SessionConfig {
    /// Whether a membership belongs to this call.
    pub fn matches(&self, membership: &CallMembership) -> bool {
        membership.application() == self.application
            && membership.call_id() == self.call_id
            && membership.scope() == self.scope
    }
}

/// Which encryption manager a session uses.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EncryptionMode {
    /// [`EncryptionManager`]: a new key for every membership change.
    Basic,
    /// [`RtcEncryptionManager`]: a new key only when someone leaves.
    #[default]
    PerParticipant,
}

/// How a session exchanges media keys.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum KeyTransportKind {
    ToDevice,
    Room,
    #[default]
    Combined,
}

/// Configuration of the sessions of a [`MatrixRtcSessionManager`].
///
/// [`MatrixRtcSessionManager`]: crate::MatrixRtcSessionManager
#[derive(Clone, Copy, Debug, Default)]
pub struct RtcConfig {
    pub(crate) membership: MembershipConfig,
    pub(crate) encryption: EncryptionConfig,
    pub(crate) encryption_mode: EncryptionMode,
    pub(crate) key_transport: KeyTransportKind,
}

impl RtcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn membership(mut self, membership: MembershipConfig) -> Self {
        self.membership = membership;
        self
    }

    #[must_use]
    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = encryption;
        self
    }

    #[must_use]
    pub fn encryption_mode(mut self, encryption_mode: EncryptionMode) -> Self {
        self.encryption_mode = encryption_mode;
        self
    }

    #[must_use]
    pub fn key_transport(mut self, key_transport: KeyTransportKind) -> Self {
        self.key_transport = key_transport;
        self
    }
}

#[derive(Debug, Default)]
struct Memberships {
    /// Memberships from room state, by state key.
    state: BTreeMap<String, Vec<CallMembership>>,
    /// Memberships from sticky events, by sender and sticky key.
    sticky: BTreeMap<(OwnedUserId, String), CallMembership>,
    /// The merged, unexpired memberships, oldest first.
    current: Vec<CallMembership>,
}

struct SessionInner {
    room_id: OwnedRoomId,
    own: ParticipantId,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    memberships: Mutex<Memberships>,
    updates: broadcast::Sender<Vec<CallMembership>>,
    membership_manager: MembershipManager,
    encryption: Arc<dyn CallEncryption>,
    key_transport: Arc<dyn KeyTransport>,
    expiry_timer: Mutex<Option<AbortOnDrop<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The call of a room.
///
/// The session collects the memberships of the call from room state and
/// sticky events, and lets the local device join and leave the call. Sticky
/// memberships take precedence over state memberships of the same device.
///
/// Cloning the session is cheap, clones share the same call.
#[derive(Clone)]
pub struct MatrixRtcSession {
    inner: Arc<SessionInner>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for MatrixRtcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixRtcSession")
            .field("room_id", &self.inner.room_id)
            .field("config", &self.inner.config)
            .field("memberships", &lock(&self.inner.memberships).current.len())
            .finish_non_exhaustive()
    }
}

impl MatrixRtcSession {
    /// Create the session of a room.
    ///
    /// This spawns the tasks of the membership and encryption managers of
    /// the local device `own`.
    pub fn new(
        room_id: &RoomId,
        room_version: Option<&str>,
        own: ParticipantId,
        config: SessionConfig,
        transport: Arc<dyn RtcTransport>,
        rtc_config: RtcConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let key_transport: Arc<dyn KeyTransport> = match rtc_config.key_transport {
            KeyTransportKind::ToDevice => Arc::new(ToDeviceKeyTransport::new(
                transport.clone(),
                room_id,
                own.clone(),
                config.clone(),
            )),
            KeyTransportKind::Room => Arc::new(RoomKeyTransport::new(
                transport.clone(),
                room_id,
                own.clone(),
                &config,
            )),
            KeyTransportKind::Combined => Arc::new(CombinedKeyTransport::new(
                transport.clone(),
                room_id,
                own.clone(),
                config.clone(),
            )),
        };

        let encryption: Arc<dyn CallEncryption> = match rtc_config.encryption_mode {
            EncryptionMode::Basic => Arc::new(EncryptionManager::new(
                own.clone(),
                key_transport.clone(),
                rtc_config.encryption,
                clock.clone(),
            )),
            EncryptionMode::PerParticipant => Arc::new(RtcEncryptionManager::new(
                own.clone(),
                key_transport.clone(),
                rtc_config.encryption,
                clock.clone(),
            )),
        };

        let membership_manager = MembershipManager::new(
            room_id,
            room_version,
            own.clone(),
            config.clone(),
            transport,
            rtc_config.membership,
            clock.clone(),
        );

        let (updates, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(SessionInner {
                room_id: room_id.to_owned(),
                own,
                config,
                clock,
                memberships: Mutex::default(),
                updates,
                membership_manager,
                encryption,
                key_transport,
                expiry_timer: Mutex::new(None),
            }),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Handle a call member state event of the room.
    ///
    /// The event replaces the memberships previously found under its state
    /// key. Returns whether the memberships of the call changed.
    pub fn on_state_event(&self, event: &JsonValue) -> bool {
        let Some(state_key) = event.get("state_key").and_then(JsonValue::as_str) else {
            return false;
        };
        if event.get("type").and_then(JsonValue::as_str) != Some(CALL_MEMBER_EVENT_TYPE) {
            return false;
        }

        let memberships =
            match call_memberships_from_state_event(event, self.inner.clock.now_millis()) {
                Ok(memberships) => memberships,
                Err(error) => {
                    warn!(state_key, %error, "Ignoring an invalid call membership");
                    Vec::new()
                }
            };

        {
            let mut state = lock(&self.inner.memberships);
            if memberships.is_empty() {
                state.state.remove(state_key);
            } else {
                state.state.insert(state_key.to_owned(), memberships);
            }
        }

        self.inner.recompute()
    }

    /// Handle a sticky call member event of the room.
    ///
    /// Returns whether the memberships of the call changed.
    pub fn on_sticky_event(&self, event: &JsonValue) -> bool {
        if event.get("type").and_then(JsonValue::as_str) != Some(CALL_MEMBER_EVENT_TYPE) {
            return false;
        }

        let sender = event
            .get("sender")
            .and_then(JsonValue::as_str)
            .and_then(|sender| OwnedUserId::try_from(sender).ok());
        let sticky_key =
            event.pointer("/content/msc4354_sticky_key").and_then(JsonValue::as_str);
        let (Some(sender), Some(sticky_key)) = (sender, sticky_key) else {
            warn!("Ignoring a sticky call membership without sender or sticky key");
            return false;
        };
        let key = (sender, sticky_key.to_owned());

        let membership = CallMembership::from_event(
            event,
            MembershipSource::Sticky,
            self.inner.clock.now_millis(),
        );

        {
            let mut state = lock(&self.inner.memberships);
            match membership {
                Ok(membership) => {
                    state.sticky.insert(key, membership);
                }
                Err(error) => {
                    // A sticky event without membership is how a device leaves.
                    trace!(%error, "Removing a sticky call membership");
                    state.sticky.remove(&key);
                }
            }
        }

        self.inner.recompute()
    }

    /// Handle a to-device event, returns whether it was a media key for this
    /// call.
    pub fn on_to_device_event(&self, event: &JsonValue) -> bool {
        self.inner.key_transport.on_to_device_event(event)
    }

    /// Handle a room event, returns whether it was a media key for this
    /// call.
    pub async fn on_room_event(&self, event: &JsonValue) -> bool {
        self.inner.key_transport.on_room_event(event).await
    }

    /// The unexpired memberships of the call, oldest first.
    ///
    /// Memberships are sorted by creation timestamp, then by participant.
    pub fn memberships(&self) -> Vec<CallMembership> {
        let now = self.inner.clock.now_millis();
        lock(&self.inner.memberships)
            .current
            .iter()
            .filter(|membership| !membership.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn oldest_membership(&self) -> Option<CallMembership> {
        self.memberships().into_iter().next()
    }

    /// The focus the call should use.
    ///
    /// When the oldest membership asks for the focus of the oldest
    /// membership, that's its first preferred focus.
    pub fn resolve_active_focus(&self) -> Option<Focus> {
        let oldest = self.oldest_membership()?;
        let selection = oldest.focus_active()?.focus_selection.as_deref();

        if selection == Some(OLDEST_MEMBERSHIP_FOCUS_SELECTION) {
            oldest.preferred_foci().first().cloned()
        } else {
            None
        }
    }

    /// The intent all the memberships agree on, if any.
    ///
    /// Memberships without intent don't count.
    pub fn consensus_intent(&self) -> Option<String> {
        let memberships = self.memberships();
        let mut intents = memberships.iter().filter_map(CallMembership::intent);

        let first = intents.next()?;
        intents.all(|intent| intent == first).then(|| first.to_owned())
    }

    /// Join the call with the local device.
    #[instrument(skip_all, fields(room_id = %self.inner.room_id))]
    pub fn join_room_session(
        &self,
        foci_preferred: Vec<Focus>,
        focus_active: Option<ActiveFocus>,
        intent: Option<String>,
    ) {
        debug!("Joining the call");

        self.inner.membership_manager.join(foci_preferred, focus_active, intent);
        self.inner.encryption.join();
        self.inner.encryption.on_memberships_changed(&self.memberships());
    }

    /// Leave the call, see [`MembershipManager::leave`].
    #[instrument(skip_all, fields(room_id = %self.inner.room_id))]
    pub async fn leave_room_session(&self, timeout: Option<Duration>) -> bool {
        debug!("Leaving the call");

        self.inner.encryption.leave();
        self.inner.membership_manager.leave(timeout).await
    }

    /// Whether the local device joined the call.
    pub fn is_joined(&self) -> bool {
        self.inner.membership_manager.is_joined()
    }

    /// Subscribe to the memberships of the call, every change sends the new
    /// list.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<CallMembership>> {
        self.inner.updates.subscribe()
    }

    /// Subscribe to the media keys that start being used.
    pub fn subscribe_to_keys(&self) -> broadcast::Receiver<EncryptionKeyChanged> {
        self.inner.encryption.subscribe()
    }

    pub fn membership_manager(&self) -> &MembershipManager {
        &self.inner.membership_manager
    }

    pub fn encryption(&self) -> &Arc<dyn CallEncryption> {
        &self.inner.encryption
    }

    /// The local device.
    pub fn own_participant(&self) -> &ParticipantId {
        &self.inner.own
    }
}

impl SessionInner {
    /// Merge the memberships again, and tell everybody interested if they
    /// changed.
    fn recompute(self: &Arc<Self>) -> bool {
        let now = self.clock.now_millis();

        let changed = {
            let mut state = lock(&self.memberships);

            // Only live memberships of this call compete for a participant.
            let mut merged = BTreeMap::new();
            for membership in state.state.values().flatten().chain(state.sticky.values()) {
                if self.config.matches(membership) && !membership.is_expired(now) {
                    merged.insert(membership.participant(), membership);
                }
            }

            let mut current: Vec<CallMembership> = merged.into_values().cloned().collect();
            current.sort_by(|a, b| {
                (a.created_ts(), a.participant()).cmp(&(b.created_ts(), b.participant()))
            });

            let changed = current != state.current;
            state.current = current;
            changed.then(|| state.current.clone())
        };

        self.rearm_expiry_timer(now);

        let Some(memberships) = changed else {
            return false;
        };

        debug!(room_id = %self.room_id, count = memberships.len(), "The call memberships changed");

        self.membership_manager.on_rtc_session_member_update(&memberships);
        self.encryption.on_memberships_changed(&memberships);
        let _ = self.updates.send(memberships);

        true
    }

    /// Recompute the memberships when the next one expires.
    fn rearm_expiry_timer(self: &Arc<Self>, now: u64) {
        let next_expiry = lock(&self.memberships)
            .current
            .iter()
            .map(|membership| membership.ms_until_expiry(now))
            .filter(|remaining| *remaining > 0)
            .min();

        let timer = next_expiry.map(|remaining| {
            let delay = Duration::from_millis(remaining.unsigned_abs());
            let session: Weak<Self> = Arc::downgrade(self);

            spawn(async move {
                sleep(delay).await;

                if let Some(session) = session.upgrade() {
                    trace!(room_id = %session.room_id, "A call membership expired");
                    session.recompute();
                }
            })
            .abort_on_drop()
        });

        *lock(&self.expiry_timer) = timer;
    }
}
