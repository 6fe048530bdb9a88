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

use ruma::{OwnedRoomId, RoomId};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

/// Builder for the JSON of a joined room in a sync response.
#[derive(Debug)]
pub struct JoinedRoomBuilder {
    pub(super) room_id: OwnedRoomId,
    state: Vec<JsonValue>,
    timeline: Vec<JsonValue>,
    limited: bool,
    prev_batch: Option<String>,
    ephemeral: Vec<JsonValue>,
    account_data: Vec<JsonValue>,
    sticky: Vec<JsonValue>,
    unread_notifications: Option<JsonValue>,
    summary: Option<JsonValue>,
}

impl JoinedRoomBuilder {
    /// Create a new `JoinedRoomBuilder` for the given room ID.
    pub fn new(room_id: &RoomId) -> Self {
        Self {
            room_id: room_id.to_owned(),
            state: Vec::new(),
            timeline: Vec::new(),
            limited: false,
            prev_batch: None,
            ephemeral: Vec::new(),
            account_data: Vec::new(),
            sticky: Vec::new(),
            unread_notifications: None,
            summary: None,
        }
    }

    /// Add a state event to the `state` section of the room.
    pub fn add_state_event(mut self, event: JsonValue) -> Self {
        self.state.push(event);
        self
    }

    /// Add an event to the timeline.
    pub fn add_timeline_event(mut self, event: JsonValue) -> Self {
        self.timeline.push(event);
        self
    }

    /// Add events in bulk to the timeline.
    pub fn add_timeline_bulk<I>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = JsonValue>,
    {
        self.timeline.extend(events);
        self
    }

    /// Set the timeline as limited.
    pub fn set_timeline_limited(mut self) -> Self {
        self.limited = true;
        self
    }

    /// Set the `prev_batch` of the timeline.
    pub fn set_timeline_prev_batch(mut self, prev_batch: impl Into<String>) -> Self {
        self.prev_batch = Some(prev_batch.into());
        self
    }

    /// Add an ephemeral event, a receipt or a typing notice.
    pub fn add_ephemeral_event(mut self, event: JsonValue) -> Self {
        self.ephemeral.push(event);
        self
    }

    /// Add room account data.
    pub fn add_account_data(mut self, event: JsonValue) -> Self {
        self.account_data.push(event);
        self
    }

    /// Add a sticky event to the `msc4354_sticky` section of the room.
    pub fn add_sticky_event(mut self, event: JsonValue) -> Self {
        self.sticky.push(event);
        self
    }

    /// Set the unread notification counts of the room.
    pub fn set_unread_notifications_count(
        mut self,
        highlight_count: u64,
        notification_count: u64,
    ) -> Self {
        self.unread_notifications = Some(json!({
            "highlight_count": highlight_count,
            "notification_count": notification_count,
        }));
        self
    }

    /// Set the room summary.
    pub fn set_room_summary(mut self, summary: JsonValue) -> Self {
        self.summary = Some(summary);
        self
    }

    pub(super) fn into_json(self) -> JsonValue {
        let mut timeline = json!({ "events": self.timeline, "limited": self.limited });
        if let Some(prev_batch) = self.prev_batch {
            timeline["prev_batch"] = prev_batch.into();
        }

        let mut room = JsonMap::new();
        room.insert("state".to_owned(), json!({ "events": self.state }));
        room.insert("timeline".to_owned(), timeline);
        room.insert("ephemeral".to_owned(), json!({ "events": self.ephemeral }));
        room.insert("account_data".to_owned(), json!({ "events": self.account_data }));

        if !self.sticky.is_empty() {
            room.insert("msc4354_sticky".to_owned(), json!({ "events": self.sticky }));
        }
        if let Some(unread_notifications) = self.unread_notifications {
            room.insert("unread_notifications".to_owned(), unread_notifications);
        }
        if let Some(summary) = self.summary {
            room.insert("summary".to_owned(), summary);
        }

        JsonValue::Object(room)
    }
}

/// Builder for the stripped state of an invited or knocked room.
#[derive(Debug)]
pub struct InvitedRoomBuilder {
    pub(super) room_id: OwnedRoomId,
    pub(super) events: Vec<JsonValue>,
}

impl InvitedRoomBuilder {
    pub fn new(room_id: &RoomId) -> Self {
        Self { room_id: room_id.to_owned(), events: Vec::new() }
    }

    /// Add a stripped state event.
    pub fn add_state_event(mut self, event: JsonValue) -> Self {
        self.events.push(event);
        self
    }
}
