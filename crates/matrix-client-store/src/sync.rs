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

//! The `/sync` payload, as the accumulator consumes it.
//!
//! Only the top-level `next_batch` token is mandatory. Every other section is
//! parsed leniently: a section with an unexpected shape is logged and treated
//! as empty, and rooms are only parsed one by one when they are accumulated,
//! so one malformed room never prevents the others from being processed.

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, RoomId};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::SyncError;

/// A raw JSON object.
pub type JsonObject = serde_json::Map<String, JsonValue>;

/// Deserialize a section of the payload, falling back to its default value
/// if it has an unexpected shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = JsonValue::deserialize(deserializer)?;

    match serde_json::from_value(value) {
        Ok(section) => Ok(section),
        Err(error) => {
            warn!(?error, "Ignoring a malformed section of a sync response");
            Ok(T::default())
        }
    }
}

/// A list of raw events, the `{ "events": [...] }` shape used by most sync
/// sections.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Events {
    #[serde(default, deserialize_with = "lenient")]
    pub events: Vec<JsonValue>,
}

impl Events {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl From<Vec<JsonValue>> for Events {
    fn from(events: Vec<JsonValue>) -> Self {
        Self { events }
    }
}

/// The timeline of a room.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Timeline {
    #[serde(default, deserialize_with = "lenient")]
    pub events: Vec<JsonValue>,
    /// Whether the server skipped events between the previous sync and this
    /// one.
    #[serde(default)]
    pub limited: bool,
    /// Token to paginate backwards from the first event of this batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// Notification counts of a room or a thread.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct UnreadNotificationsCount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_count: Option<u64>,
}

/// The summary of a room, every field is optional and updates only replace
/// the fields they contain.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RoomSummary {
    #[serde(rename = "m.heroes", default, skip_serializing_if = "Option::is_none")]
    pub heroes: Option<Vec<String>>,
    #[serde(rename = "m.joined_member_count", default, skip_serializing_if = "Option::is_none")]
    pub joined_member_count: Option<u64>,
    #[serde(rename = "m.invited_member_count", default, skip_serializing_if = "Option::is_none")]
    pub invited_member_count: Option<u64>,
}

impl RoomSummary {
    pub fn is_empty(&self) -> bool {
        self.heroes.is_none()
            && self.joined_member_count.is_none()
            && self.invited_member_count.is_none()
    }
}

/// Updates to a room the user is joined to.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct JoinedRoom {
    #[serde(default, deserialize_with = "lenient")]
    pub state: Events,
    #[serde(default, deserialize_with = "lenient")]
    pub timeline: Timeline,
    #[serde(default, deserialize_with = "lenient")]
    pub account_data: Events,
    #[serde(default, deserialize_with = "lenient")]
    pub ephemeral: Events,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub unread_notifications: Option<UnreadNotificationsCount>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub unread_thread_notifications: Option<BTreeMap<String, UnreadNotificationsCount>>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "RoomSummary::is_empty")]
    pub summary: RoomSummary,
    /// Sticky events of the room (MSC4354).
    #[serde(
        rename = "msc4354_sticky",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Events::is_empty"
    )]
    pub sticky: Events,
}

/// A room the user is invited to.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct InvitedRoom {
    #[serde(default, deserialize_with = "lenient")]
    pub invite_state: Events,
}

/// A room the user knocked on.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KnockedRoom {
    #[serde(default, deserialize_with = "lenient")]
    pub knock_state: Events,
}

/// The per-membership room sections of a sync response.
///
/// Rooms are kept as raw JSON until they are accumulated.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Rooms {
    #[serde(default, deserialize_with = "lenient")]
    pub join: BTreeMap<String, JsonValue>,
    #[serde(default, deserialize_with = "lenient")]
    pub invite: BTreeMap<String, JsonValue>,
    #[serde(default, deserialize_with = "lenient")]
    pub knock: BTreeMap<String, JsonValue>,
    #[serde(default, deserialize_with = "lenient")]
    pub leave: BTreeMap<String, JsonValue>,
}

/// One incremental `/sync` response.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SyncResponse {
    /// The token to resume the sync stream from.
    pub next_batch: String,
    #[serde(default, deserialize_with = "lenient")]
    pub rooms: Rooms,
    #[serde(default, deserialize_with = "lenient")]
    pub account_data: Events,
    #[serde(default, deserialize_with = "lenient")]
    pub presence: Events,
    #[serde(default, deserialize_with = "lenient")]
    pub to_device: Events,
}

impl SyncResponse {
    /// Create an empty response carrying the given token.
    pub fn new(next_batch: impl Into<String>) -> Self {
        Self { next_batch: next_batch.into(), ..Default::default() }
    }

    /// Parse a response from its JSON form.
    ///
    /// This only fails if the payload isn't an object or doesn't have a
    /// `next_batch` string.
    pub fn from_json(json: JsonValue) -> Result<Self, SyncError> {
        serde_json::from_value(json).map_err(SyncError::InvalidResponse)
    }

    /// The joined rooms of this response that could be parsed.
    pub fn joined_rooms(&self) -> impl Iterator<Item = (OwnedRoomId, JoinedRoom)> + '_ {
        parse_rooms(&self.rooms.join, "join")
    }

    /// The invited rooms of this response that could be parsed.
    pub fn invited_rooms(&self) -> impl Iterator<Item = (OwnedRoomId, InvitedRoom)> + '_ {
        parse_rooms(&self.rooms.invite, "invite")
    }

    /// The knocked rooms of this response that could be parsed.
    pub fn knocked_rooms(&self) -> impl Iterator<Item = (OwnedRoomId, KnockedRoom)> + '_ {
        parse_rooms(&self.rooms.knock, "knock")
    }

    /// The IDs of the rooms that were left in this response.
    pub fn left_rooms(&self) -> impl Iterator<Item = OwnedRoomId> + '_ {
        self.rooms.leave.keys().filter_map(|room_id| parse_room_id(room_id, "leave"))
    }
}

fn parse_room_id(room_id: &str, section: &str) -> Option<OwnedRoomId> {
    match RoomId::parse(room_id) {
        Ok(room_id) => Some(room_id),
        Err(error) => {
            warn!(room_id, section, ?error, "Ignoring a room with an invalid ID");
            None
        }
    }
}

fn parse_rooms<'a, T: DeserializeOwned>(
    rooms: &'a BTreeMap<String, JsonValue>,
    section: &'static str,
) -> impl Iterator<Item = (OwnedRoomId, T)> + 'a {
    rooms.iter().filter_map(move |(room_id, room)| {
        let room_id = parse_room_id(room_id, section)?;

        match serde_json::from_value(room.clone()) {
            Ok(room) => Some((room_id, room)),
            Err(error) => {
                warn!(?room_id, section, ?error, "Ignoring a malformed room");
                None
            }
        }
    })
}

/// The `type` of a raw event, if it has one.
pub(crate) fn event_type(event: &JsonValue) -> Option<&str> {
    event.get("type")?.as_str()
}

/// The `state_key` of a raw event, if it is a state event.
pub(crate) fn state_key(event: &JsonValue) -> Option<&str> {
    event.get("state_key")?.as_str()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::SyncResponse;
    use crate::error::SyncError;

    #[test]
    fn test_next_batch_is_required() {
        let result = SyncResponse::from_json(json!({ "rooms": {} }));
        assert_matches!(result, Err(SyncError::InvalidResponse(_)));

        let result = SyncResponse::from_json(json!({ "next_batch": 42 }));
        assert_matches!(result, Err(SyncError::InvalidResponse(_)));
    }

    #[test]
    fn test_malformed_sections_are_ignored() {
        let response = SyncResponse::from_json(json!({
            "next_batch": "s1",
            "rooms": { "join": "not a map", "invite": { "!a:b.c": {} } },
            "account_data": { "events": 7 },
            "presence": [],
        }))
        .unwrap();

        assert_eq!(response.next_batch, "s1");
        assert!(response.rooms.join.is_empty());
        assert_eq!(response.rooms.invite.len(), 1);
        assert!(response.account_data.is_empty());
        assert!(response.presence.is_empty());
    }

    #[test]
    fn test_malformed_rooms_are_skipped() {
        let response = SyncResponse::from_json(json!({
            "next_batch": "s1",
            "rooms": {
                "join": {
                    "!good:example.org": { "timeline": { "events": [] } },
                    "!bad:example.org": "oops",
                    "not a room id": {},
                    "!number:example.org": 5,
                },
            },
        }))
        .unwrap();

        let rooms: Vec<_> = response.joined_rooms().map(|(room_id, _)| room_id).collect();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].as_str(), "!good:example.org");
    }
}
