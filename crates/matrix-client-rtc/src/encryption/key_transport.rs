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

//! The channels media keys travel through.
//!
//! Keys are either sent to each device of the call with to-device messages,
//! or broadcast to the whole room with room events. [`CombinedKeyTransport`]
//! starts with the former and switches to the latter for good as soon as
//! another participant is seen using it, or to-device messages turn out to
//! be unavailable.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use matrix_client_common::{debug::DebugSecret, AsyncTraitDeps};
use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::KeyTransportError,
    membership::ParticipantId,
    session::SessionConfig,
    transport::{RtcTransport, ENCRYPTION_KEYS_EVENT_TYPE},
};

/// A key of the local device, about to be sent to the other participants.
#[derive(Clone, Eq, PartialEq)]
pub struct OutboundKey {
    pub index: u8,
    pub key: Vec<u8>,
    pub created_ts: u64,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OutboundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundKey")
            .field("index", &self.index)
            .field("key", &DebugSecret(&self.key))
            .field("created_ts", &self.created_ts)
            .finish()
    }
}

/// A key of another participant.
#[derive(Clone, Eq, PartialEq)]
pub struct ReceivedKey {
    pub participant: ParticipantId,
    pub index: u8,
    pub key: Vec<u8>,
    /// The creation timestamp of the key, as claimed by its sender.
    pub sent_ts: u64,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for ReceivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedKey")
            .field("participant", &self.participant)
            .field("index", &self.index)
            .field("key", &DebugSecret(&self.key))
            .field("sent_ts", &self.sent_ts)
            .finish()
    }
}

/// A channel to exchange media keys with the other participants of a call.
#[async_trait]
pub trait KeyTransport: AsyncTraitDeps {
    /// Send a key of the local device to `targets`.
    ///
    /// Transports broadcasting to the room ignore `targets`.
    async fn send_key(
        &self,
        key: &OutboundKey,
        targets: &[ParticipantId],
    ) -> Result<(), KeyTransportError>;

    /// The key the local device currently encrypts with, `None` once it left.
    ///
    /// Called whenever the key changes, even when nobody else needs it yet.
    fn set_current_key(&self, _key: Option<&OutboundKey>) {}

    /// Handle a to-device event, returns whether it was a key for this call.
    fn on_to_device_event(&self, event: &JsonValue) -> bool;

    /// Handle a room event, returns whether it was a key for this call.
    async fn on_room_event(&self, event: &JsonValue) -> bool;

    /// Subscribe to the keys received from the other participants.
    fn subscribe(&self) -> broadcast::Receiver<ReceivedKey>;
}

#[derive(Debug, Deserialize)]
struct KeyEvent<C> {
    #[serde(rename = "type")]
    event_type: String,
    sender: OwnedUserId,
    content: C,
}

fn parse_key_event<C: DeserializeOwned>(event: &JsonValue) -> Option<KeyEvent<C>> {
    if event.get("type").and_then(JsonValue::as_str) != Some(ENCRYPTION_KEYS_EVENT_TYPE) {
        return None;
    }

    match serde_json::from_value::<KeyEvent<C>>(event.clone()) {
        Ok(event) => Some(event),
        Err(error) => {
            warn!(%error, "Ignoring a malformed encryption keys event");
            None
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct EncodedKey {
    index: u8,
    key: String,
}

impl EncodedKey {
    fn encode(key: &OutboundKey) -> Self {
        Self { index: key.index, key: STANDARD.encode(&key.key) }
    }

    fn decode(&self) -> Option<Vec<u8>> {
        match STANDARD.decode(&self.key) {
            Ok(key) => Some(key),
            Err(error) => {
                warn!(%error, index = self.index, "Ignoring a key that isn't valid base64");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct ClaimedMember {
    claimed_device_id: OwnedDeviceId,
}

#[derive(Debug, Deserialize, Serialize)]
struct ToDeviceKeysContent {
    keys: EncodedKey,
    member: ClaimedMember,
    room_id: OwnedRoomId,
    session: SessionConfig,
    #[serde(default)]
    sent_ts: u64,
}

#[derive(Debug, Deserialize, Serialize)]
struct RoomKeysContent {
    keys: Vec<EncodedKey>,
    device_id: OwnedDeviceId,
    call_id: String,
    #[serde(default)]
    sent_ts: u64,
}

/// Sends keys with to-device messages to every target device.
#[derive(Debug)]
pub struct ToDeviceKeyTransport {
    transport: Arc<dyn RtcTransport>,
    room_id: OwnedRoomId,
    own: ParticipantId,
    session: SessionConfig,
    keys: broadcast::Sender<ReceivedKey>,
}

impl ToDeviceKeyTransport {
    pub fn new(
        transport: Arc<dyn RtcTransport>,
        room_id: &RoomId,
        own: ParticipantId,
        session: SessionConfig,
    ) -> Self {
        Self::with_sender(transport, room_id, own, session, broadcast::channel(64).0)
    }

    fn with_sender(
        transport: Arc<dyn RtcTransport>,
        room_id: &RoomId,
        own: ParticipantId,
        session: SessionConfig,
        keys: broadcast::Sender<ReceivedKey>,
    ) -> Self {
        Self { transport, room_id: room_id.to_owned(), own, session, keys }
    }
}

#[async_trait]
impl KeyTransport for ToDeviceKeyTransport {
    #[instrument(skip_all, fields(room_id = %self.room_id, index = key.index))]
    async fn send_key(
        &self,
        key: &OutboundKey,
        targets: &[ParticipantId],
    ) -> Result<(), KeyTransportError> {
        if targets.is_empty() {
            debug!("Nobody to send the key to");
            return Ok(());
        }

        let content = ToDeviceKeysContent {
            keys: EncodedKey::encode(key),
            member: ClaimedMember { claimed_device_id: self.own.device_id.clone() },
            room_id: self.room_id.clone(),
            session: self.session.clone(),
            sent_ts: key.created_ts,
        };
        let content = serde_json::to_value(content)
            .map_err(|error| KeyTransportError::Serialization(error.to_string()))?;

        self.transport.send_to_device(ENCRYPTION_KEYS_EVENT_TYPE, targets, content).await?;
        debug!(targets = targets.len(), "Sent the key with to-device messages");

        Ok(())
    }

    fn on_to_device_event(&self, event: &JsonValue) -> bool {
        let Some(event) = parse_key_event::<ToDeviceKeysContent>(event) else {
            return false;
        };
        let content = event.content;

        if content.room_id != self.room_id || content.session != self.session {
            return false;
        }

        let participant = ParticipantId::new(&event.sender, &content.member.claimed_device_id);
        if participant == self.own {
            return true;
        }

        if let Some(key) = content.keys.decode() {
            let _ = self.keys.send(ReceivedKey {
                participant,
                index: content.keys.index,
                key,
                sent_ts: content.sent_ts,
            });
        }

        true
    }

    async fn on_room_event(&self, _event: &JsonValue) -> bool {
        false
    }

    fn subscribe(&self) -> broadcast::Receiver<ReceivedKey> {
        self.keys.subscribe()
    }
}

/// Broadcasts keys to the room with room events.
#[derive(Debug)]
pub struct RoomKeyTransport {
    transport: Arc<dyn RtcTransport>,
    room_id: OwnedRoomId,
    own: ParticipantId,
    call_id: String,
    keys: broadcast::Sender<ReceivedKey>,
}

impl RoomKeyTransport {
    pub fn new(
        transport: Arc<dyn RtcTransport>,
        room_id: &RoomId,
        own: ParticipantId,
        session: &SessionConfig,
    ) -> Self {
        Self::with_sender(transport, room_id, own, session, broadcast::channel(64).0)
    }

    fn with_sender(
        transport: Arc<dyn RtcTransport>,
        room_id: &RoomId,
        own: ParticipantId,
        session: &SessionConfig,
        keys: broadcast::Sender<ReceivedKey>,
    ) -> Self {
        Self {
            transport,
            room_id: room_id.to_owned(),
            own,
            call_id: session.call_id.clone(),
            keys,
        }
    }

    /// Handle a room event, returns whether it carried keys of this call.
    fn handle_room_event(&self, event: &JsonValue) -> bool {
        let Some(event) = parse_key_event::<RoomKeysContent>(event) else {
            return false;
        };
        let content = event.content;

        if content.call_id != self.call_id {
            return false;
        }

        let participant = ParticipantId::new(&event.sender, &content.device_id);
        if participant == self.own {
            return true;
        }

        for encoded in &content.keys {
            if let Some(key) = encoded.decode() {
                let _ = self.keys.send(ReceivedKey {
                    participant: participant.clone(),
                    index: encoded.index,
                    key,
                    sent_ts: content.sent_ts,
                });
            }
        }

        true
    }
}

#[async_trait]
impl KeyTransport for RoomKeyTransport {
    #[instrument(skip_all, fields(room_id = %self.room_id, index = key.index))]
    async fn send_key(
        &self,
        key: &OutboundKey,
        _targets: &[ParticipantId],
    ) -> Result<(), KeyTransportError> {
        let content = RoomKeysContent {
            keys: vec![EncodedKey::encode(key)],
            device_id: self.own.device_id.clone(),
            call_id: self.call_id.clone(),
            sent_ts: key.created_ts,
        };
        let content = serde_json::to_value(content)
            .map_err(|error| KeyTransportError::Serialization(error.to_string()))?;

        self.transport.send_event(&self.room_id, ENCRYPTION_KEYS_EVENT_TYPE, content).await?;
        debug!("Sent the key to the room");

        Ok(())
    }

    fn on_to_device_event(&self, _event: &JsonValue) -> bool {
        false
    }

    async fn on_room_event(&self, event: &JsonValue) -> bool {
        self.handle_room_event(event)
    }

    fn subscribe(&self) -> broadcast::Receiver<ReceivedKey> {
        self.keys.subscribe()
    }
}

/// Uses to-device messages until the room channel is needed, then the room
/// for good.
#[derive(Debug)]
pub struct CombinedKeyTransport {
    to_device: ToDeviceKeyTransport,
    room: RoomKeyTransport,
    use_room: AtomicBool,
    /// Sent to the room when switching to it.
    current_key: Mutex<Option<OutboundKey>>,
    keys: broadcast::Sender<ReceivedKey>,
}

impl CombinedKeyTransport {
    pub fn new(
        transport: Arc<dyn RtcTransport>,
        room_id: &RoomId,
        own: ParticipantId,
        session: SessionConfig,
    ) -> Self {
        let (keys, _) = broadcast::channel(64);

        let room =
            RoomKeyTransport::with_sender(transport.clone(), room_id, own.clone(), &session, keys.clone());
        let to_device =
            ToDeviceKeyTransport::with_sender(transport, room_id, own, session, keys.clone());

        Self {
            to_device,
            room,
            use_room: AtomicBool::new(false),
            current_key: Mutex::new(None),
            keys,
        }
    }

    /// Whether keys are sent to the room now.
    pub fn is_using_room(&self) -> bool {
        self.use_room.load(Ordering::SeqCst)
    }

    /// Switch to the room, returns `false` if that already happened.
    fn switch_to_room(&self) -> bool {
        !self.use_room.swap(true, Ordering::SeqCst)
    }

    fn remember(&self, key: Option<&OutboundKey>) {
        if let Ok(mut current_key) = self.current_key.lock() {
            *current_key = key.cloned();
        }
    }
}

#[async_trait]
impl KeyTransport for CombinedKeyTransport {
    async fn send_key(
        &self,
        key: &OutboundKey,
        targets: &[ParticipantId],
    ) -> Result<(), KeyTransportError> {
        self.remember(Some(key));

        if self.is_using_room() {
            return self.room.send_key(key, targets).await;
        }

        match self.to_device.send_key(key, targets).await {
            Err(KeyTransportError::Unsupported) => {
                if self.switch_to_room() {
                    info!("To-device messages are unavailable, sending keys to the room from now on");
                }
                self.room.send_key(key, targets).await
            }
            result => result,
        }
    }

    fn set_current_key(&self, key: Option<&OutboundKey>) {
        self.remember(key);
    }

    fn on_to_device_event(&self, event: &JsonValue) -> bool {
        self.to_device.on_to_device_event(event)
    }

    async fn on_room_event(&self, event: &JsonValue) -> bool {
        if !self.room.handle_room_event(event) {
            return false;
        }

        if self.switch_to_room() {
            info!("Received a key in the room, sending keys to the room from now on");

            let current_key = self.current_key.lock().ok().and_then(|key| key.clone());
            if let Some(key) = current_key {
                if let Err(error) = self.room.send_key(&key, &[]).await {
                    warn!(%error, "Failed to send the latest key to the room");
                }
            }
        }

        true
    }

    fn subscribe(&self) -> broadcast::Receiver<ReceivedKey> {
        self.keys.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches2::assert_let;
    use matrix_client_test::{ALICE, ALICE_DEVICE, BOB, BOB_DEVICE, DEFAULT_TEST_ROOM_ID};
    use serde_json::json;

    use super::{
        CombinedKeyTransport, KeyTransport, OutboundKey, RoomKeyTransport, ToDeviceKeyTransport,
    };
    use crate::{
        error::{KeyTransportError, TransportError},
        membership::ParticipantId,
        session::SessionConfig,
        testing::{MockTransport, TransportCall, TransportMethod},
    };

    fn alice() -> ParticipantId {
        ParticipantId::new(&ALICE, &ALICE_DEVICE)
    }

    fn bob() -> ParticipantId {
        ParticipantId::new(&BOB, &BOB_DEVICE)
    }

    fn key(index: u8) -> OutboundKey {
        OutboundKey { index, key: vec![1, 2, 3, 4], created_ts: 1_500 }
    }

    fn bob_room_key_event() -> serde_json::Value {
        json!({
            "type": "io.element.call.encryption_keys",
            "sender": "@bob:other.server",
            "event_id": "$keys",
            "origin_server_ts": 2_000,
            "content": {
                "keys": [{ "index": 2, "key": "BQYH" }],
                "device_id": "BOBDEVICE",
                "call_id": "",
                "sent_ts": 2_000,
            },
        })
    }

    #[tokio::test]
    async fn test_to_device_key_format() {
        let mock = Arc::new(MockTransport::new());
        let transport = ToDeviceKeyTransport::new(
            mock.clone(),
            &DEFAULT_TEST_ROOM_ID,
            alice(),
            SessionConfig::default(),
        );

        transport.send_key(&key(1), &[bob()]).await.unwrap();

        let calls = mock.calls();
        assert_let!(
            [TransportCall::SendToDevice { event_type, targets, content }] = calls.as_slice()
        );
        assert_eq!(event_type, "io.element.call.encryption_keys");
        assert_eq!(*targets, [bob()]);
        similar_asserts::assert_eq!(
            *content,
            json!({
                "keys": { "index": 1, "key": "AQIDBA==" },
                "member": { "claimed_device_id": "ALICEDEVICE" },
                "room_id": "!SVkFJHzfwvuaIEawgC:localhost",
                "session": { "application": "m.call", "call_id": "", "scope": "m.room" },
                "sent_ts": 1_500,
            })
        );

        // Nobody to send to, nothing is sent.
        transport.send_key(&key(2), &[]).await.unwrap();
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_to_device_keys_are_received() {
        let transport = ToDeviceKeyTransport::new(
            Arc::new(MockTransport::new()),
            &DEFAULT_TEST_ROOM_ID,
            alice(),
            SessionConfig::default(),
        );
        let mut keys = transport.subscribe();

        let event = json!({
            "type": "io.element.call.encryption_keys",
            "sender": "@bob:other.server",
            "content": {
                "keys": { "index": 4, "key": "BQYH" },
                "member": { "claimed_device_id": "BOBDEVICE" },
                "room_id": "!SVkFJHzfwvuaIEawgC:localhost",
                "session": { "application": "m.call", "call_id": "", "scope": "m.room" },
                "sent_ts": 3_000,
            },
        });
        assert!(transport.on_to_device_event(&event));

        let received = keys.recv().await.unwrap();
        assert_eq!(received.participant, bob());
        assert_eq!(received.index, 4);
        assert_eq!(received.key, [5, 6, 7]);
        assert_eq!(received.sent_ts, 3_000);

        let mut other_room = event.clone();
        other_room["content"]["room_id"] = "!other:localhost".into();
        assert!(!transport.on_to_device_event(&other_room));

        let not_a_key = json!({ "type": "m.room_key", "sender": "@bob:other.server", "content": {} });
        assert!(!transport.on_to_device_event(&not_a_key));
    }

    #[tokio::test]
    async fn test_room_keys_of_the_local_device_are_ignored() {
        let transport = RoomKeyTransport::new(
            Arc::new(MockTransport::new()),
            &DEFAULT_TEST_ROOM_ID,
            ParticipantId::new(&BOB, &BOB_DEVICE),
            &SessionConfig::default(),
        );
        let mut keys = transport.subscribe();

        assert!(transport.on_room_event(&bob_room_key_event()).await);
        assert!(keys.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_combined_transport_switches_on_a_room_key() {
        let mock = Arc::new(MockTransport::new());
        let transport = CombinedKeyTransport::new(
            mock.clone(),
            &DEFAULT_TEST_ROOM_ID,
            alice(),
            SessionConfig::default(),
        );
        let mut keys = transport.subscribe();

        transport.send_key(&key(0), &[bob()]).await.unwrap();
        assert_eq!(mock.count(TransportMethod::SendToDevice), 1);
        assert!(!transport.is_using_room());

        assert!(transport.on_room_event(&bob_room_key_event()).await);
        assert!(transport.is_using_room());

        let received = keys.recv().await.unwrap();
        assert_eq!(received.participant, bob());
        assert_eq!(received.index, 2);

        // The latest key went to the room right away.
        let room_calls = mock.calls_to(TransportMethod::SendEvent);
        assert_eq!(room_calls.len(), 1);
        assert_eq!(room_calls[0].content().unwrap()["keys"][0]["index"], 0);

        transport.send_key(&key(1), &[bob()]).await.unwrap();
        assert_eq!(mock.count(TransportMethod::SendEvent), 2);
        assert_eq!(mock.count(TransportMethod::SendToDevice), 1);
    }

    #[tokio::test]
    async fn test_combined_transport_sends_an_unsent_current_key_when_switching() {
        let mock = Arc::new(MockTransport::new());
        let transport = CombinedKeyTransport::new(
            mock.clone(),
            &DEFAULT_TEST_ROOM_ID,
            alice(),
            SessionConfig::default(),
        );

        // Alone in the call, the key never went anywhere.
        transport.set_current_key(Some(&key(3)));
        assert!(mock.calls().is_empty());

        assert!(transport.on_room_event(&bob_room_key_event()).await);

        let room_calls = mock.calls_to(TransportMethod::SendEvent);
        assert_eq!(room_calls.len(), 1);
        assert_eq!(room_calls[0].content().unwrap()["keys"][0]["index"], 3);
    }

    #[tokio::test]
    async fn test_combined_transport_forgets_the_key_after_leaving() {
        let mock = Arc::new(MockTransport::new());
        let transport = CombinedKeyTransport::new(
            mock.clone(),
            &DEFAULT_TEST_ROOM_ID,
            alice(),
            SessionConfig::default(),
        );

        transport.send_key(&key(0), &[bob()]).await.unwrap();
        transport.set_current_key(None);

        assert!(transport.on_room_event(&bob_room_key_event()).await);
        assert!(transport.is_using_room());
        assert_eq!(mock.count(TransportMethod::SendEvent), 0);
    }

    #[tokio::test]
    async fn test_combined_transport_switches_when_to_device_is_unsupported() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_next(TransportMethod::SendToDevice, TransportError::Unsupported);

        let transport = CombinedKeyTransport::new(
            mock.clone(),
            &DEFAULT_TEST_ROOM_ID,
            alice(),
            SessionConfig::default(),
        );

        transport.send_key(&key(0), &[bob()]).await.unwrap();

        assert!(transport.is_using_room());
        assert_eq!(mock.count(TransportMethod::SendEvent), 1);

        // Other errors don't make the transport switch.
        let mock = Arc::new(MockTransport::new());
        mock.fail_next(
            TransportMethod::SendToDevice,
            TransportError::Http { status: 500, message: "oops".to_owned() },
        );
        let transport = CombinedKeyTransport::new(
            mock.clone(),
            &DEFAULT_TEST_ROOM_ID,
            alice(),
            SessionConfig::default(),
        );

        assert_let!(Err(KeyTransportError::Transport(_)) = transport.send_key(&key(0), &[bob()]).await);
        assert!(!transport.is_using_room());
    }
}
