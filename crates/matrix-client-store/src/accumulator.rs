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

//! Folding of incremental sync responses into one snapshot.
//!
//! The [`SyncAccumulator`] keeps, per joined room, the current state (one
//! event per `(type, state_key)`), a bounded timeline, room account data,
//! notification counts, the room summary and the latest read receipts. The
//! snapshot it produces can be fed back with
//! [`SyncAccumulator::accumulate_from_database`] to rebuild the exact same
//! state after a restart.

use std::{collections::BTreeMap, fmt, sync::Arc};

use matrix_client_common::time::{Clock, SystemClock};
use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{instrument, trace, warn};

use crate::{
    config::DEFAULT_MAX_TIMELINE_ENTRIES,
    sync::{
        event_type, state_key, Events, InvitedRoom, JoinedRoom, JsonObject, KnockedRoom,
        RoomSummary, SyncResponse, Timeline, UnreadNotificationsCount,
    },
};

/// Name of the helper field holding the local receipt time of a timeline
/// event in the database form of the snapshot.
const LOCAL_TS_FIELD: &str = "_localTs";

/// The receipt types that are kept.
const SUPPORTED_RECEIPT_TYPES: &[&str] = &["m.read", "m.read.private"];

/// The thread ID of receipts for the main timeline.
const MAIN_THREAD: &str = "main";

/// `(event type, state key)`.
type StateMap = BTreeMap<(String, String), JsonValue>;

/// An owned snapshot of the accumulated sync data.
///
/// It has the shape of a sync response, so it can be replayed through
/// [`SyncAccumulator::accumulate_from_database`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SavedSync {
    /// The token to resume syncing from.
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SavedRooms,
    #[serde(default)]
    pub account_data: Events,
    #[serde(default)]
    pub presence: Events,
}

/// The rooms of a [`SavedSync`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SavedRooms {
    #[serde(default)]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,
    #[serde(default)]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,
    #[serde(default)]
    pub knock: BTreeMap<OwnedRoomId, KnockedRoom>,
}

#[derive(Clone, Debug)]
struct TimelineEntry {
    event: JsonValue,
    /// The back-pagination token of the batch this event started, if any.
    token: Option<String>,
    /// When the event was created, on the local clock.
    local_ts: u64,
}

impl TimelineEntry {
    fn new(mut event: JsonValue, token: Option<String>, from_database: bool, now: u64) -> Self {
        let stored_local_ts = if from_database {
            event
                .as_object_mut()
                .and_then(|event| event.remove(LOCAL_TS_FIELD))
                .and_then(|local_ts| local_ts.as_u64())
        } else {
            None
        };

        let local_ts = stored_local_ts.unwrap_or_else(|| {
            let age = event.pointer("/unsigned/age").and_then(JsonValue::as_u64).unwrap_or(0);
            now.saturating_sub(age)
        });

        // The age is recomputed from the local timestamp on every read.
        if let Some(unsigned) = event.get_mut("unsigned").and_then(JsonValue::as_object_mut) {
            unsigned.remove("age");
        }

        Self { event, token, local_ts }
    }

    fn to_json(&self, for_database: bool, now: u64) -> JsonValue {
        let mut event = self.event.clone();

        if let Some(object) = event.as_object_mut() {
            if for_database {
                object.insert(LOCAL_TS_FIELD.to_owned(), self.local_ts.into());
            } else {
                let unsigned = object.entry("unsigned").or_insert_with(|| json!({}));
                if let Some(unsigned) = unsigned.as_object_mut() {
                    unsigned.insert("age".to_owned(), now.saturating_sub(self.local_ts).into());
                }
            }
        }

        event
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ReceiptKey {
    user_id: String,
    receipt_type: String,
    /// `None` for the main timeline.
    thread_id: Option<String>,
}

#[derive(Clone, Debug)]
struct Receipt {
    event_id: String,
    data: JsonValue,
}

/// Everything accumulated for one joined room.
#[derive(Clone, Debug, Default)]
struct RoomAccumulation {
    state: StateMap,
    timeline: Vec<TimelineEntry>,
    account_data: BTreeMap<String, JsonValue>,
    unread_notifications: Option<UnreadNotificationsCount>,
    unread_thread_notifications: BTreeMap<String, UnreadNotificationsCount>,
    summary: RoomSummary,
    receipts: BTreeMap<ReceiptKey, Receipt>,
}

impl RoomAccumulation {
    fn accumulate_receipts(&mut self, event: &JsonValue) {
        if event_type(event) != Some("m.receipt") {
            // Typing notifications and other ephemeral events aren't kept.
            return;
        }

        let Some(content) = event.get("content").and_then(JsonValue::as_object) else {
            return;
        };

        for (event_id, receipts) in content {
            let Some(receipts) = receipts.as_object() else { continue };

            for (receipt_type, users) in receipts {
                if !SUPPORTED_RECEIPT_TYPES.contains(&receipt_type.as_str()) {
                    continue;
                }

                let Some(users) = users.as_object() else { continue };

                for (user_id, data) in users {
                    let thread_id = data
                        .get("thread_id")
                        .and_then(JsonValue::as_str)
                        .filter(|thread_id| *thread_id != MAIN_THREAD)
                        .map(ToOwned::to_owned);

                    let key = ReceiptKey {
                        user_id: user_id.clone(),
                        receipt_type: receipt_type.clone(),
                        thread_id,
                    };
                    self.receipts
                        .insert(key, Receipt { event_id: event_id.clone(), data: data.clone() });
                }
            }
        }
    }

    /// All the kept receipts, as one `m.receipt` event.
    fn receipt_event(&self) -> Option<JsonValue> {
        if self.receipts.is_empty() {
            return None;
        }

        let mut content = JsonObject::new();

        for (key, receipt) in &self.receipts {
            let by_type = content.entry(receipt.event_id.clone()).or_insert_with(|| json!({}));
            let Some(by_type) = by_type.as_object_mut() else { continue };

            let by_user = by_type.entry(key.receipt_type.clone()).or_insert_with(|| json!({}));
            if let Some(by_user) = by_user.as_object_mut() {
                by_user.insert(key.user_id.clone(), receipt.data.clone());
            }
        }

        Some(json!({ "type": "m.receipt", "content": content }))
    }

    /// Drop the oldest timeline events so at most `max_entries` remain,
    /// making sure the timeline still starts at a pagination token.
    fn prune_timeline(&mut self, max_entries: usize) {
        let len = self.timeline.len();
        if len <= max_entries {
            return;
        }

        let first_kept = len - max_entries;
        let start = self.timeline[first_kept..]
            .iter()
            .position(|entry| entry.token.is_some())
            .map_or(first_kept, |offset| first_kept + offset);

        trace!(dropped = start, "Pruning the timeline");
        self.timeline.drain(..start);
    }

    fn to_joined_room(&self, for_database: bool, now: u64) -> JoinedRoom {
        // Events before the first pagination token can't be paginated to, so
        // they are left out.
        let mut prev_batch = None;
        let mut timeline_events = Vec::with_capacity(self.timeline.len());

        for entry in &self.timeline {
            if prev_batch.is_none() {
                let Some(token) = &entry.token else { continue };
                prev_batch = Some(token.clone());
            }

            timeline_events.push(entry.to_json(for_database, now));
        }

        // The state block describes the room at the start of the timeline, so
        // every state event of the timeline is rolled back to its previous
        // value.
        let mut rolled_back = StateMap::new();

        for event in timeline_events.iter().rev() {
            if state_key(event).is_none() {
                continue;
            }

            let mut previous = event.clone();

            if let Some(object) = previous.as_object_mut() {
                let unsigned = object.get("unsigned").cloned().unwrap_or_default();

                if let Some(prev_content) = unsigned.get("prev_content") {
                    object.insert("content".to_owned(), prev_content.clone());
                }
                if let Some(prev_sender) = unsigned.get("prev_sender") {
                    object.insert("sender".to_owned(), prev_sender.clone());
                }
            }

            set_state(&mut rolled_back, previous);
        }

        let state = self
            .state
            .iter()
            .map(|(key, event)| rolled_back.get(key).unwrap_or(event).clone())
            .collect::<Vec<_>>();

        JoinedRoom {
            state: state.into(),
            timeline: Timeline { events: timeline_events, limited: false, prev_batch },
            account_data: self.account_data.values().cloned().collect::<Vec<_>>().into(),
            ephemeral: self.receipt_event().into_iter().collect::<Vec<_>>().into(),
            unread_notifications: self.unread_notifications,
            unread_thread_notifications: (!self.unread_thread_notifications.is_empty())
                .then(|| self.unread_thread_notifications.clone()),
            summary: self.summary.clone(),
            sticky: Events::default(),
        }
    }
}

/// Insert a state event in the state map, replacing the previous event with
/// the same `(type, state_key)`.
fn set_state(state: &mut StateMap, mut event: JsonValue) {
    let (Some(event_type), Some(state_key)) = (event_type(&event), state_key(&event)) else {
        warn!("Ignoring a state event without a type or state key");
        return;
    };
    let key = (event_type.to_owned(), state_key.to_owned());

    if let Some(object) = event.as_object_mut() {
        object.remove(LOCAL_TS_FIELD);
    }

    state.insert(key, event);
}

/// Replace the stripped state events with the same `(type, state_key)` as
/// the new ones, and append the others.
fn merge_stripped_state(current: &mut Vec<JsonValue>, new: Vec<JsonValue>) {
    for event in new {
        let existing = current.iter_mut().find(|current| {
            event_type(current) == event_type(&event) && state_key(current) == state_key(&event)
        });

        match existing {
            Some(existing) => *existing = event,
            None => current.push(event),
        }
    }
}

/// Folds sync responses into a single snapshot.
///
/// The accumulator never fails: rooms and events with an unexpected shape are
/// logged and skipped.
pub struct SyncAccumulator {
    next_batch: Option<String>,
    max_timeline_entries: usize,
    clock: Arc<dyn Clock>,
    account_data: BTreeMap<String, JsonValue>,
    presence: BTreeMap<String, JsonValue>,
    joined_rooms: BTreeMap<OwnedRoomId, RoomAccumulation>,
    invited_rooms: BTreeMap<OwnedRoomId, Vec<JsonValue>>,
    knocked_rooms: BTreeMap<OwnedRoomId, Vec<JsonValue>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SyncAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncAccumulator")
            .field("next_batch", &self.next_batch)
            .field("max_timeline_entries", &self.max_timeline_entries)
            .field("joined_rooms", &self.joined_rooms.len())
            .field("invited_rooms", &self.invited_rooms.len())
            .field("knocked_rooms", &self.knocked_rooms.len())
            .finish_non_exhaustive()
    }
}

impl Default for SyncAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TIMELINE_ENTRIES)
    }
}

impl SyncAccumulator {
    /// Create an empty accumulator keeping up to `max_timeline_entries`
    /// timeline events per room.
    pub fn new(max_timeline_entries: usize) -> Self {
        Self {
            next_batch: None,
            max_timeline_entries,
            clock: Arc::new(SystemClock),
            account_data: BTreeMap::new(),
            presence: BTreeMap::new(),
            joined_rooms: BTreeMap::new(),
            invited_rooms: BTreeMap::new(),
            knocked_rooms: BTreeMap::new(),
        }
    }

    /// Use the given clock to compute the local timestamps and ages of
    /// timeline events.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Forget everything that was accumulated.
    pub fn clear(&mut self) {
        self.next_batch = None;
        self.account_data.clear();
        self.presence.clear();
        self.joined_rooms.clear();
        self.invited_rooms.clear();
        self.knocked_rooms.clear();
    }

    /// The `next_batch` token of the last accumulated response.
    pub fn next_batch_token(&self) -> Option<&str> {
        self.next_batch.as_deref()
    }

    /// The current state event of a joined room for the given type and state
    /// key.
    pub fn state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Option<&JsonValue> {
        self.joined_rooms
            .get(room_id)?
            .state
            .get(&(event_type.to_owned(), state_key.to_owned()))
    }

    /// The latest global account data event of the given type.
    pub fn account_data(&self, event_type: &str) -> Option<&JsonValue> {
        self.account_data.get(event_type)
    }

    /// Merge a sync response from the server.
    #[instrument(skip_all, fields(next_batch = %response.next_batch))]
    pub fn accumulate(&mut self, response: &SyncResponse) {
        self.accumulate_global(&response.account_data.events, &response.presence.events);

        for (room_id, room) in response.invited_rooms() {
            self.accumulate_invited_room(room_id, room.invite_state.events);
        }
        for (room_id, room) in response.knocked_rooms() {
            self.accumulate_knocked_room(room_id, room.knock_state.events);
        }
        for (room_id, room) in response.joined_rooms() {
            self.accumulate_joined_room(room_id, room, false);
        }
        for room_id in response.left_rooms() {
            self.joined_rooms.remove(&room_id);
            self.invited_rooms.remove(&room_id);
            self.knocked_rooms.remove(&room_id);
        }

        self.next_batch = Some(response.next_batch.clone());
    }

    /// Merge a snapshot previously produced by
    /// [`get_json(true)`](Self::get_json), keeping the local timestamps it
    /// recorded.
    #[instrument(skip_all, fields(next_batch = %saved.next_batch))]
    pub fn accumulate_from_database(&mut self, saved: SavedSync) {
        self.accumulate_global(&saved.account_data.events, &saved.presence.events);

        for (room_id, room) in saved.rooms.invite {
            self.accumulate_invited_room(room_id, room.invite_state.events);
        }
        for (room_id, room) in saved.rooms.knock {
            self.accumulate_knocked_room(room_id, room.knock_state.events);
        }
        for (room_id, room) in saved.rooms.join {
            self.accumulate_joined_room(room_id, room, true);
        }

        self.next_batch = Some(saved.next_batch);
    }

    fn accumulate_global(&mut self, account_data: &[JsonValue], presence: &[JsonValue]) {
        for event in account_data {
            match event_type(event) {
                Some(event_type) => {
                    self.account_data.insert(event_type.to_owned(), event.clone());
                }
                None => warn!("Ignoring an account data event without a type"),
            }
        }

        for event in presence {
            match event.get("sender").and_then(JsonValue::as_str) {
                Some(sender) => {
                    self.presence.insert(sender.to_owned(), event.clone());
                }
                None => warn!("Ignoring a presence event without a sender"),
            }
        }
    }

    fn accumulate_invited_room(&mut self, room_id: OwnedRoomId, events: Vec<JsonValue>) {
        if events.is_empty() {
            return;
        }

        self.knocked_rooms.remove(&room_id);
        merge_stripped_state(self.invited_rooms.entry(room_id).or_default(), events);
    }

    fn accumulate_knocked_room(&mut self, room_id: OwnedRoomId, events: Vec<JsonValue>) {
        if events.is_empty() {
            return;
        }

        merge_stripped_state(self.knocked_rooms.entry(room_id).or_default(), events);
    }

    fn accumulate_joined_room(&mut self, room_id: OwnedRoomId, room: JoinedRoom, from_database: bool) {
        self.invited_rooms.remove(&room_id);
        self.knocked_rooms.remove(&room_id);

        let now = self.clock.now_millis();
        let max_timeline_entries = self.max_timeline_entries;
        let accumulation = self.joined_rooms.entry(room_id).or_default();

        for event in room.account_data.events {
            let Some(event_type) = event_type(&event).map(ToOwned::to_owned) else {
                warn!("Ignoring a room account data event without a type");
                continue;
            };
            accumulation.account_data.insert(event_type, event);
        }

        if let Some(counts) = room.unread_notifications {
            accumulation.unread_notifications = Some(counts);
        }
        if let Some(counts) = room.unread_thread_notifications {
            accumulation.unread_thread_notifications = counts;
        }

        let summary = room.summary;
        if summary.heroes.is_some() {
            accumulation.summary.heroes = summary.heroes;
        }
        if summary.joined_member_count.is_some() {
            accumulation.summary.joined_member_count = summary.joined_member_count;
        }
        if summary.invited_member_count.is_some() {
            accumulation.summary.invited_member_count = summary.invited_member_count;
        }

        for event in &room.ephemeral.events {
            accumulation.accumulate_receipts(event);
        }

        for event in room.state.events {
            set_state(&mut accumulation.state, event);
        }

        if room.timeline.limited {
            accumulation.timeline.clear();
        }

        let mut token = room.timeline.prev_batch;

        for event in room.timeline.events {
            if !event.is_object() {
                warn!("Ignoring a timeline event that isn't an object");
                continue;
            }

            if state_key(&event).is_some() {
                set_state(&mut accumulation.state, event.clone());
            }

            accumulation.timeline.push(TimelineEntry::new(event, token.take(), from_database, now));
        }

        accumulation.prune_timeline(max_timeline_entries);
    }

    /// Produce an owned snapshot of the accumulated data.
    ///
    /// With `for_database`, timeline events keep the local timestamp helper
    /// field so [`accumulate_from_database`](Self::accumulate_from_database)
    /// can restore it. Otherwise it is replaced by a fresh `unsigned.age`.
    pub fn get_json(&self, for_database: bool) -> SavedSync {
        let now = self.clock.now_millis();

        let join = self
            .joined_rooms
            .iter()
            .map(|(room_id, room)| (room_id.clone(), room.to_joined_room(for_database, now)))
            .collect();
        let invite = self
            .invited_rooms
            .iter()
            .map(|(room_id, events)| {
                (room_id.clone(), InvitedRoom { invite_state: events.clone().into() })
            })
            .collect();
        let knock = self
            .knocked_rooms
            .iter()
            .map(|(room_id, events)| {
                (room_id.clone(), KnockedRoom { knock_state: events.clone().into() })
            })
            .collect();

        SavedSync {
            next_batch: self.next_batch.clone().unwrap_or_default(),
            rooms: SavedRooms { join, invite, knock },
            account_data: self.account_data.values().cloned().collect::<Vec<_>>().into(),
            presence: self.presence.values().cloned().collect::<Vec<_>>().into(),
        }
    }

    /// The snapshot for consumers, or `None` if nothing was accumulated yet.
    pub fn saved_sync(&self) -> Option<SavedSync> {
        self.next_batch.as_ref()?;
        Some(self.get_json(false))
    }
}
