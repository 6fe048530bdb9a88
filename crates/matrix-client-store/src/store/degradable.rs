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
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use matrix_client_common::sleep::Instant;
use ruma::{OwnedUserId, RoomId, UserId};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::{debug, error, instrument, trace, warn};

use super::{MemoryStore, PersistenceBackend, PresenceTuple};
use crate::{accumulator::SavedSync, config::StoreConfig, error::StoreError, sync::SyncResponse};

/// Whether a [`DegradableStore`] still uses its backend.
#[derive(Debug)]
pub enum StoreState<B> {
    /// Everything is read from and written to the backend.
    Active(Arc<B>),
    /// The backend failed once and was abandoned, the [`MemoryStore`] serves
    /// every operation.
    Degraded,
}

/// Notifications sent by a [`DegradableStore`].
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    /// The backend failed and the store fell back to memory.
    Degraded {
        /// The store operation during which the backend failed.
        operation: &'static str,
        /// The error of the backend.
        reason: String,
    },
}

/// A store that never fails.
///
/// The first error of the backend degrades the store: the error is logged,
/// a [`StoreEvent::Degraded`] is sent, the backend is asked to clear what it
/// wrote so far, and every operation from then on, including the one that
/// failed, is served by an in-memory store. The backend is never called
/// again afterwards.
pub struct DegradableStore<B> {
    state: RwLock<StoreState<B>>,
    memory: MemoryStore,
    config: StoreConfig,
    last_save: Mutex<Option<Instant>>,
    /// The presence versions, as counted by the memory store, the backend
    /// knows about.
    written_presence: Mutex<HashMap<OwnedUserId, u64>>,
    events: broadcast::Sender<StoreEvent>,
}

#[cfg(not(tarpaulin_include))]
impl<B: fmt::Debug> fmt::Debug for DegradableStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradableStore")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: PersistenceBackend> DegradableStore<B> {
    /// Create a store over the given, not yet connected, backend.
    ///
    /// Call [`startup`](Self::startup) before anything else.
    pub fn new(backend: B, config: StoreConfig) -> Self {
        let (events, _) = broadcast::channel(16);

        Self {
            state: RwLock::new(StoreState::Active(Arc::new(backend))),
            memory: MemoryStore::new(),
            config,
            last_save: Mutex::new(None),
            written_presence: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// The backend, unless the store is degraded.
    pub fn backend(&self) -> Option<Arc<B>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            StoreState::Active(backend) => Some(backend.clone()),
            StoreState::Degraded => None,
        }
    }

    /// Whether the store fell back to memory.
    pub fn is_degraded(&self) -> bool {
        self.backend().is_none()
    }

    /// Get notified when the store gets degraded.
    pub fn subscribe_to_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Run `operation` on the backend.
    ///
    /// Returns `None` if the store is degraded, or got degraded because the
    /// operation failed, the caller then falls back to the memory store.
    async fn with_backend<T, F, Fut>(&self, operation: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(Arc<B>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let backend = self.backend()?;

        match f(backend).await {
            Ok(value) => Some(value),
            Err(error) => {
                self.degrade(operation, error).await;
                None
            }
        }
    }

    async fn degrade(&self, operation: &'static str, error: StoreError) {
        let backend = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

            match std::mem::replace(&mut *state, StoreState::Degraded) {
                StoreState::Active(backend) => backend,
                // Another operation failed concurrently and already did the work.
                StoreState::Degraded => return,
            }
        };

        error!(operation, %error, "The store backend failed, falling back to the memory store");

        let _ = self.events.send(StoreEvent::Degraded { operation, reason: error.to_string() });

        if let Err(error) = backend.clear_database().await {
            warn!(%error, "Failed to clear the data of the failed store backend");
        }
    }

    /// Connect the backend, and load the presence it knows about.
    #[instrument(skip_all)]
    pub async fn startup(&self) {
        let presence = self
            .with_backend("startup", |backend| async move {
                backend.connect().await?;
                backend.user_presence_events().await
            })
            .await;

        let Some(presence) = presence else { return };

        debug!(num_presence = presence.len(), "Loaded the presence from the store backend");

        let mut written = lock(&self.written_presence);

        for PresenceTuple { user_id, event } in presence {
            self.memory.set_presence(&user_id, event);

            if let Some(version) = self.memory.presence_version(&user_id) {
                written.insert(user_id, version);
            }
        }
    }

    /// Whether the backend had to create its storage.
    ///
    /// A degraded store has nothing stored, so this is `true` then.
    pub async fn is_newly_created(&self) -> bool {
        self.with_backend("is_newly_created", |backend| async move {
            backend.is_newly_created().await
        })
        .await
        .unwrap_or(true)
    }

    /// The saved snapshot of the sync accumulator.
    pub async fn saved_sync(&self) -> Option<SavedSync> {
        self.with_backend("saved_sync", |backend| async move { backend.saved_sync().await })
            .await
            .flatten()
    }

    /// The token to resume syncing from.
    pub async fn saved_sync_token(&self) -> Option<String> {
        match self
            .with_backend("saved_sync_token", |backend| async move {
                backend.next_batch_token().await
            })
            .await
        {
            Some(token) => token,
            None => self.memory.sync_token(),
        }
    }

    /// Give a sync response to the store.
    ///
    /// The memory store records its token and presence, the backend
    /// accumulates it.
    #[instrument(skip_all, fields(next_batch = %response.next_batch))]
    pub async fn set_sync_data(&self, response: &SyncResponse) {
        self.memory.set_sync_token(response.next_batch.clone());

        for event in &response.presence.events {
            let user_id = event
                .get("sender")
                .and_then(JsonValue::as_str)
                .and_then(|sender| UserId::parse(sender).ok());

            match user_id {
                Some(user_id) => self.memory.set_presence(&user_id, event.clone()),
                None => trace!("Skipping a presence event without a valid sender"),
            }
        }

        self.with_backend("set_sync_data", |backend| async move {
            backend.set_sync_data(response).await
        })
        .await;
    }

    /// Record the latest presence event of a user.
    pub fn set_presence(&self, user_id: &UserId, event: JsonValue) {
        self.memory.set_presence(user_id, event);
    }

    /// The latest presence event of a user.
    pub fn presence(&self, user_id: &UserId) -> Option<JsonValue> {
        self.memory.presence(user_id)
    }

    /// Whether enough time passed since the last write for a new one.
    pub fn wants_save(&self) -> bool {
        if self.is_degraded() {
            return false;
        }

        match *lock(&self.last_save) {
            Some(last_save) => last_save.elapsed() > self.config.write_delay,
            None => true,
        }
    }

    /// Write the accumulated data and the changed presence to the backend.
    ///
    /// Unless `force` is set, nothing is written if the last write is too
    /// recent, see [`wants_save`](Self::wants_save).
    #[instrument(skip(self))]
    pub async fn save(&self, force: bool) {
        if self.is_degraded() || !force && !self.wants_save() {
            return;
        }

        // Set before writing, so a concurrent caller doesn't write as well.
        *lock(&self.last_save) = Some(Instant::now());

        let changed = {
            let written = lock(&self.written_presence);
            self.memory.presence_changed_since(&written)
        };

        let (presence, versions): (Vec<_>, Vec<_>) = changed.into_iter().unzip();
        let user_ids: Vec<OwnedUserId> = presence.iter().map(|p| p.user_id.clone()).collect();

        debug!(num_presence = presence.len(), "Writing the sync data");

        let saved = self
            .with_backend("save", |backend| async move {
                backend.sync_to_database(presence).await
            })
            .await;

        if saved.is_some() {
            lock(&self.written_presence).extend(user_ids.into_iter().zip(versions));
        }
    }

    pub async fn get_out_of_band_members(&self, room_id: &RoomId) -> Option<Vec<JsonValue>> {
        match self
            .with_backend("get_out_of_band_members", |backend| async move {
                backend.get_out_of_band_members(room_id).await
            })
            .await
        {
            Some(members) => members,
            None => self.memory.get_out_of_band_members(room_id),
        }
    }

    pub async fn set_out_of_band_members(&self, room_id: &RoomId, members: Vec<JsonValue>) {
        let stored = self
            .with_backend("set_out_of_band_members", |backend| {
                let members = members.clone();
                async move { backend.set_out_of_band_members(room_id, members).await }
            })
            .await;

        if stored.is_none() {
            self.memory.set_out_of_band_members(room_id, members);
        }
    }

    pub async fn clear_out_of_band_members(&self, room_id: &RoomId) {
        let cleared = self
            .with_backend("clear_out_of_band_members", |backend| async move {
                backend.clear_out_of_band_members(room_id).await
            })
            .await;

        if cleared.is_none() {
            self.memory.clear_out_of_band_members(room_id);
        }
    }

    pub async fn get_client_options(&self) -> Option<JsonValue> {
        match self
            .with_backend("get_client_options", |backend| async move {
                backend.get_client_options().await
            })
            .await
        {
            Some(options) => options,
            None => self.memory.get_client_options(),
        }
    }

    pub async fn store_client_options(&self, options: JsonValue) {
        let stored = self
            .with_backend("store_client_options", |backend| {
                let options = options.clone();
                async move { backend.store_client_options(options).await }
            })
            .await;

        if stored.is_none() {
            self.memory.store_client_options(options);
        }
    }

    /// Forget everything, in memory and in the backend.
    #[instrument(skip_all)]
    pub async fn delete_all_data(&self) {
        self.memory.clear();
        lock(&self.written_presence).clear();
        *lock(&self.last_save) = None;

        self.with_backend("delete_all_data", |backend| async move {
            backend.clear_database().await
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use matrix_client_test::ALICE;
    use ruma::RoomId;
    use serde_json::{json, Value as JsonValue};

    use super::DegradableStore;
    use crate::{
        config::StoreConfig,
        store::{PersistenceBackend, PresenceTuple},
        Result, SavedSync, SyncResponse,
    };

    #[derive(Debug)]
    struct NoopBackend;

    #[async_trait]
    impl PersistenceBackend for NoopBackend {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn is_newly_created(&self) -> Result<bool> {
            Ok(false)
        }

        async fn saved_sync(&self) -> Result<Option<SavedSync>> {
            Ok(None)
        }

        async fn next_batch_token(&self) -> Result<Option<String>> {
            Ok(None)
        }

        async fn set_sync_data(&self, _: &SyncResponse) -> Result<()> {
            Ok(())
        }

        async fn sync_to_database(&self, _: Vec<PresenceTuple>) -> Result<()> {
            Ok(())
        }

        async fn user_presence_events(&self) -> Result<Vec<PresenceTuple>> {
            Ok(Vec::new())
        }

        async fn get_out_of_band_members(&self, _: &RoomId) -> Result<Option<Vec<JsonValue>>> {
            Ok(None)
        }

        async fn set_out_of_band_members(&self, _: &RoomId, _: Vec<JsonValue>) -> Result<()> {
            Ok(())
        }

        async fn clear_out_of_band_members(&self, _: &RoomId) -> Result<()> {
            Ok(())
        }

        async fn clear_database(&self) -> Result<()> {
            Ok(())
        }

        async fn get_client_options(&self) -> Result<Option<JsonValue>> {
            Ok(None)
        }

        async fn store_client_options(&self, _: JsonValue) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wants_save_follows_the_write_delay() {
        let config = StoreConfig::new().write_delay(Duration::from_secs(60));
        let store = DegradableStore::new(NoopBackend, config);

        assert!(store.wants_save());

        store.save(false).await;
        assert!(!store.wants_save());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!store.wants_save());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.wants_save());
    }

    #[tokio::test]
    async fn test_presence_is_kept_in_memory() {
        let store = DegradableStore::new(NoopBackend, StoreConfig::default());
        let event = json!({ "type": "m.presence", "sender": *ALICE, "content": {} });

        store.set_presence(&ALICE, event.clone());
        assert_eq!(store.presence(&ALICE), Some(event));

        store.delete_all_data().await;
        assert_eq!(store.presence(&ALICE), None);
        assert!(!store.is_degraded());
    }
}
