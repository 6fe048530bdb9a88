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

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, RoomId, UserId};
use serde_json::{json, Value as JsonValue};

mod joined_room;

pub use joined_room::{InvitedRoomBuilder, JoinedRoomBuilder};

/// The `SyncResponseBuilder` struct can be used to easily generate raw JSON
/// sync responses for testing. These can be then fed into the sync
/// accumulator or the RTC session manager.
///
/// Every built response gets a fresh `next_batch` token.
#[derive(Debug, Default)]
pub struct SyncResponseBuilder {
    /// Updates to joined rooms.
    joined_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Updates to invited rooms.
    invited_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Updates to knocked rooms.
    knocked_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Rooms we left.
    left_rooms: BTreeMap<OwnedRoomId, JsonValue>,
    /// Events that determine the presence state of a user.
    presence: Vec<JsonValue>,
    /// Global account data events.
    account_data: Vec<JsonValue>,
    to_device_events: Vec<JsonValue>,
    /// Internal counter to enable the `next_batch` of each sync response to
    /// vary.
    batch_counter: i64,
}

impl SyncResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a joined room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_joined_room(&mut self, room: JoinedRoomBuilder) -> &mut Self {
        self.invited_rooms.remove(&room.room_id);
        self.knocked_rooms.remove(&room.room_id);
        self.left_rooms.remove(&room.room_id);
        let room_id = room.room_id.clone();
        self.joined_rooms.insert(room_id, room.into_json());
        self
    }

    /// Add an invited room to the next sync response.
    pub fn add_invited_room(&mut self, room: InvitedRoomBuilder) -> &mut Self {
        self.joined_rooms.remove(&room.room_id);
        self.knocked_rooms.remove(&room.room_id);
        self.left_rooms.remove(&room.room_id);
        self.invited_rooms
            .insert(room.room_id, json!({ "invite_state": { "events": room.events } }));
        self
    }

    /// Add a knocked room, with the given stripped state, to the next sync
    /// response.
    pub fn add_knocked_room(&mut self, room: InvitedRoomBuilder) -> &mut Self {
        self.joined_rooms.remove(&room.room_id);
        self.invited_rooms.remove(&room.room_id);
        self.left_rooms.remove(&room.room_id);
        self.knocked_rooms
            .insert(room.room_id, json!({ "knock_state": { "events": room.events } }));
        self
    }

    /// Add a room we left to the next sync response.
    pub fn add_left_room(&mut self, room_id: &RoomId) -> &mut Self {
        self.joined_rooms.remove(room_id);
        self.invited_rooms.remove(room_id);
        self.knocked_rooms.remove(room_id);
        self.left_rooms.insert(
            room_id.to_owned(),
            json!({ "state": { "events": [] }, "timeline": { "events": [], "limited": false } }),
        );
        self
    }

    /// Add a presence event.
    pub fn add_presence_event(&mut self, user_id: &UserId, presence: &str) -> &mut Self {
        self.presence.push(json!({
            "type": "m.presence",
            "sender": user_id,
            "content": { "presence": presence },
        }));
        self
    }

    /// Add custom global account data based on a JSON value.
    pub fn add_global_account_data(&mut self, event: JsonValue) -> &mut Self {
        self.account_data.push(event);
        self
    }

    /// Add a to-device event.
    pub fn add_to_device_event(&mut self, event: JsonValue) -> &mut Self {
        self.to_device_events.push(event);
        self
    }

    /// Builds a sync response as a JSON value containing the events we queued
    /// so far.
    ///
    /// The next response will then be empty if no further events were queued.
    pub fn build_json_sync_response(&mut self) -> JsonValue {
        self.batch_counter += 1;
        let next_batch = self.generate_sync_token();

        let body = json!({
            "next_batch": next_batch,
            "rooms": {
                "invite": self.invited_rooms,
                "join": self.joined_rooms,
                "knock": self.knocked_rooms,
                "leave": self.left_rooms,
            },
            "to_device": {
                "events": self.to_device_events,
            },
            "presence": {
                "events": self.presence,
            },
            "account_data": {
                "events": self.account_data,
            },
        });

        // Clear state so that the next sync response will be empty if nothing
        // was added.
        self.clear();

        body
    }

    fn generate_sync_token(&self) -> String {
        format!("t392-516_47314_0_7_1_1_1_11444_{}", self.batch_counter)
    }

    pub fn clear(&mut self) {
        self.account_data.clear();
        self.invited_rooms.clear();
        self.joined_rooms.clear();
        self.knocked_rooms.clear();
        self.left_rooms.clear();
        self.presence.clear();
        self.to_device_events.clear();
    }
}
