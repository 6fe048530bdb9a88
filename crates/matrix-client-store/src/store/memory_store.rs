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

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::Value as JsonValue;

use super::PresenceTuple;

#[derive(Debug)]
struct PresenceEntry {
    event: JsonValue,
    /// Bumped every time the entry changes, to know what wasn't written yet.
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    sync_token: Option<String>,
    presence: BTreeMap<OwnedUserId, PresenceEntry>,
    next_presence_version: u64,
    oob_members: BTreeMap<OwnedRoomId, Vec<JsonValue>>,
    client_options: Option<JsonValue>,
}

/// The in-memory store.
///
/// It serves the data that doesn't need the backend (the sync token and
/// presence) and stands in for the backend once a [`DegradableStore`] got
/// degraded. It has no snapshot: [`saved_sync`] is always `None` and saving
/// is a no-op.
///
/// [`DegradableStore`]: super::DegradableStore
/// [`saved_sync`]: super::DegradableStore::saved_sync
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sync_token(&self) -> Option<String> {
        self.read().sync_token.clone()
    }

    pub fn set_sync_token(&self, token: String) {
        self.write().sync_token = Some(token);
    }

    /// Record the latest presence event of a user.
    pub fn set_presence(&self, user_id: &UserId, event: JsonValue) {
        let mut inner = self.write();
        inner.next_presence_version += 1;
        let version = inner.next_presence_version;
        inner.presence.insert(user_id.to_owned(), PresenceEntry { event, version });
    }

    /// The latest presence event of a user.
    pub fn presence(&self, user_id: &UserId) -> Option<JsonValue> {
        self.read().presence.get(user_id).map(|entry| entry.event.clone())
    }

    /// The presence events that changed since the versions in `written`, with
    /// their current version.
    pub(crate) fn presence_changed_since(
        &self,
        written: &HashMap<OwnedUserId, u64>,
    ) -> Vec<(PresenceTuple, u64)> {
        self.read()
            .presence
            .iter()
            .filter(|(user_id, entry)| written.get(*user_id) != Some(&entry.version))
            .map(|(user_id, entry)| {
                let tuple = PresenceTuple { user_id: user_id.clone(), event: entry.event.clone() };
                (tuple, entry.version)
            })
            .collect()
    }

    /// The current version of the presence entry of a user.
    pub(crate) fn presence_version(&self, user_id: &UserId) -> Option<u64> {
        self.read().presence.get(user_id).map(|entry| entry.version)
    }

    pub fn get_out_of_band_members(&self, room_id: &RoomId) -> Option<Vec<JsonValue>> {
        self.read().oob_members.get(room_id).cloned()
    }

    pub fn set_out_of_band_members(&self, room_id: &RoomId, members: Vec<JsonValue>) {
        self.write().oob_members.insert(room_id.to_owned(), members);
    }

    pub fn clear_out_of_band_members(&self, room_id: &RoomId) {
        self.write().oob_members.remove(room_id);
    }

    pub fn get_client_options(&self) -> Option<JsonValue> {
        self.read().client_options.clone()
    }

    pub fn store_client_options(&self, options: JsonValue) {
        self.write().client_options = Some(options);
    }

    /// Forget everything.
    pub fn clear(&self) {
        *self.write() = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use matrix_client_test::{ALICE, BOB, DEFAULT_TEST_ROOM_ID};
    use serde_json::json;

    use super::MemoryStore;

    #[test]
    fn test_out_of_band_members_distinguish_never_fetched() {
        let store = MemoryStore::new();
        assert_eq!(store.get_out_of_band_members(*DEFAULT_TEST_ROOM_ID), None);

        store.set_out_of_band_members(*DEFAULT_TEST_ROOM_ID, Vec::new());
        assert_eq!(store.get_out_of_band_members(*DEFAULT_TEST_ROOM_ID), Some(Vec::new()));

        store.clear_out_of_band_members(*DEFAULT_TEST_ROOM_ID);
        assert_eq!(store.get_out_of_band_members(*DEFAULT_TEST_ROOM_ID), None);
    }

    #[test]
    fn test_only_changed_presence_is_reported() {
        let store = MemoryStore::new();
        store.set_presence(*ALICE, json!({ "content": { "presence": "online" } }));
        store.set_presence(*BOB, json!({ "content": { "presence": "offline" } }));

        let changed = store.presence_changed_since(&HashMap::new());
        assert_eq!(changed.len(), 2);

        let written = changed
            .into_iter()
            .map(|(tuple, version)| (tuple.user_id, version))
            .collect::<HashMap<_, _>>();
        assert!(store.presence_changed_since(&written).is_empty());

        store.set_presence(*BOB, json!({ "content": { "presence": "online" } }));
        let changed = store.presence_changed_since(&written);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0.user_id, BOB.to_owned());
    }
}
