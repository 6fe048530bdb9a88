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

//! The network operations the RTC managers need.

use std::time::Duration;

use async_trait::async_trait;
use matrix_client_common::AsyncTraitDeps;
use ruma::{OwnedEventId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{error::TransportError, membership::ParticipantId};

/// The event type of call memberships, in room state and as sticky events.
pub const CALL_MEMBER_EVENT_TYPE: &str = "org.matrix.msc3401.call.member";

/// The event type carrying media keys, as to-device message or room event.
pub const ENCRYPTION_KEYS_EVENT_TYPE: &str = "io.element.call.encryption_keys";

/// What to do with a delayed event, see [`RtcTransport::update_delayed_event`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateDelayedEventAction {
    /// Restart the timeout of the delayed event.
    Restart,
    /// Send the delayed event right away.
    Send,
    /// Drop the delayed event without sending it.
    Cancel,
}

/// Access to the homeserver, as far as calls are concerned.
///
/// Implementations map their errors to the [`TransportError`] variants the
/// managers react to; any error mapped to [`TransportError::Http`] with a
/// status below 500 is treated as unrecoverable.
#[async_trait]
pub trait RtcTransport: AsyncTraitDeps {
    /// Send a state event, returning its event ID.
    async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<OwnedEventId, TransportError>;

    /// Schedule a state event to be sent by the server after `delay`,
    /// returning the ID of the delayed event.
    async fn send_delayed_state_event(
        &self,
        room_id: &RoomId,
        delay: Duration,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<String, TransportError>;

    /// Restart, send or cancel a delayed event.
    async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: UpdateDelayedEventAction,
    ) -> Result<(), TransportError>;

    /// Send the same to-device message to every target device.
    async fn send_to_device(
        &self,
        event_type: &str,
        targets: &[ParticipantId],
        content: JsonValue,
    ) -> Result<(), TransportError>;

    /// Send a message-like event, returning its event ID.
    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: JsonValue,
    ) -> Result<OwnedEventId, TransportError>;
}
