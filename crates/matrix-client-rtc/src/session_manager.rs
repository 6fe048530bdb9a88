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

//! One [`MatrixRtcSession`] per room, fed from sync responses.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use matrix_client_common::{
    executor::{spawn, AbortOnDrop, JoinHandleExt},
    time::Clock,
};
use matrix_client_store::{JoinedRoom, SyncResponse};
use ruma::{OwnedRoomId, RoomId};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, instrument, trace};

use crate::{
    membership::{CallMembership, ParticipantId},
    session::{MatrixRtcSession, RtcConfig, SessionConfig},
    transport::{RtcTransport, CALL_MEMBER_EVENT_TYPE, ENCRYPTION_KEYS_EVENT_TYPE},
};

/// A call started or ended in a room.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionManagerEvent {
    /// The first membership of a call appeared.
    SessionStarted(OwnedRoomId),
    /// The last membership of a call went away.
    SessionEnded(OwnedRoomId),
}

struct RoomSession {
    session: MatrixRtcSession,
    _watcher: AbortOnDrop<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn event_type(event: &JsonValue) -> Option<&str> {
    event.get("type").and_then(JsonValue::as_str)
}

/// The calls of every room of the account.
pub struct MatrixRtcSessionManager {
    own: ParticipantId,
    session_config: SessionConfig,
    transport: Arc<dyn RtcTransport>,
    config: RtcConfig,
    clock: Arc<dyn Clock>,
    room_versions: Mutex<BTreeMap<OwnedRoomId, String>>,
    sessions: Mutex<BTreeMap<OwnedRoomId, RoomSession>>,
    events: broadcast::Sender<SessionManagerEvent>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for MatrixRtcSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixRtcSessionManager")
            .field("own", &self.own)
            .field("session_config", &self.session_config)
            .field("rooms", &lock(&self.sessions).keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MatrixRtcSessionManager {
    /// Create the manager of the sessions of the local device `own`, for the
    /// call described by `session_config` in every room.
    pub fn new(
        own: ParticipantId,
        session_config: SessionConfig,
        transport: Arc<dyn RtcTransport>,
        config: RtcConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);

        Self {
            own,
            session_config,
            transport,
            config,
            clock,
            room_versions: Mutex::default(),
            sessions: Mutex::default(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionManagerEvent> {
        self.events.subscribe()
    }

    /// The session of a room, if any call event was seen in it.
    pub fn get_room_session(&self, room_id: &RoomId) -> Option<MatrixRtcSession> {
        lock(&self.sessions).get(room_id).map(|room| room.session.clone())
    }

    /// The session of a room, created if needed.
    pub fn get_or_create_room_session(&self, room_id: &RoomId) -> MatrixRtcSession {
        let mut sessions = lock(&self.sessions);

        if let Some(room) = sessions.get(room_id) {
            return room.session.clone();
        }

        let room_version = lock(&self.room_versions).get(room_id).cloned();
        debug!(%room_id, ?room_version, "Creating the call session of a room");

        let session = MatrixRtcSession::new(
            room_id,
            room_version.as_deref(),
            self.own.clone(),
            self.session_config.clone(),
            self.transport.clone(),
            self.config,
            self.clock.clone(),
        );

        let watcher = spawn(watch_session(
            room_id.to_owned(),
            session.subscribe(),
            self.events.clone(),
        ))
        .abort_on_drop();

        sessions.insert(room_id.to_owned(), RoomSession { session: session.clone(), _watcher: watcher });
        session
    }

    /// Feed a sync response to the sessions.
    ///
    /// Call membership events create the session of their room. Media keys
    /// received as to-device messages are routed by the room they claim to
    /// belong to.
    #[instrument(skip_all, fields(next_batch = %response.next_batch))]
    pub async fn handle_sync_response(&self, response: &SyncResponse) {
        for (room_id, room) in response.joined_rooms() {
            self.handle_joined_room(&room_id, &room).await;
        }

        for event in &response.to_device.events {
            if event_type(event) != Some(ENCRYPTION_KEYS_EVENT_TYPE) {
                continue;
            }

            let Some(room_id) = event
                .pointer("/content/room_id")
                .and_then(JsonValue::as_str)
                .and_then(|room_id| RoomId::parse(room_id).ok())
            else {
                trace!("Ignoring a to-device key without room");
                continue;
            };

            match self.get_room_session(&room_id) {
                Some(session) => {
                    session.on_to_device_event(event);
                }
                None => trace!(%room_id, "Ignoring a to-device key for a room without call"),
            }
        }

        for room_id in response.left_rooms() {
            let Some(room) = lock(&self.sessions).remove(&room_id) else {
                continue;
            };

            info!(%room_id, "Left a room, dropping its call session");

            if !room.session.memberships().is_empty() {
                let _ = self.events.send(SessionManagerEvent::SessionEnded(room_id));
            }
        }
    }

    async fn handle_joined_room(&self, room_id: &RoomId, room: &JoinedRoom) {
        let state_events: Vec<&JsonValue> = room
            .state
            .events
            .iter()
            .chain(room.timeline.events.iter().filter(|event| event.get("state_key").is_some()))
            .collect();

        for event in &state_events {
            if event_type(event) == Some("m.room.create") {
                let version = event
                    .pointer("/content/room_version")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("1");
                lock(&self.room_versions).insert(room_id.to_owned(), version.to_owned());
            }
        }

        let is_call_member = |event: &&JsonValue| event_type(event) == Some(CALL_MEMBER_EVENT_TYPE);
        let has_call_events = state_events.iter().any(is_call_member)
            || room.sticky.events.iter().any(|event| is_call_member(&event));

        let session = if has_call_events {
            Some(self.get_or_create_room_session(room_id))
        } else {
            self.get_room_session(room_id)
        };
        let Some(session) = session else {
            return;
        };

        for event in state_events.into_iter().filter(is_call_member) {
            session.on_state_event(event);
        }

        for event in room.sticky.events.iter().filter(|event| is_call_member(event)) {
            session.on_sticky_event(event);
        }

        for event in &room.timeline.events {
            if event_type(event) == Some(ENCRYPTION_KEYS_EVENT_TYPE) {
                session.on_room_event(event).await;
            }
        }
    }
}

/// Turn the membership updates of a session into started and ended events.
async fn watch_session(
    room_id: OwnedRoomId,
    mut updates: broadcast::Receiver<Vec<CallMembership>>,
    events: broadcast::Sender<SessionManagerEvent>,
) {
    let mut active = false;

    loop {
        let memberships = match updates.recv().await {
            Ok(memberships) => memberships,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        let now_active = !memberships.is_empty();
        if now_active == active {
            continue;
        }
        active = now_active;

        let event = if active {
            info!(%room_id, "A call started");
            SessionManagerEvent::SessionStarted(room_id.clone())
        } else {
            info!(%room_id, "A call ended");
            SessionManagerEvent::SessionEnded(room_id.clone())
        };

        let _ = events.send(event);
    }
}
