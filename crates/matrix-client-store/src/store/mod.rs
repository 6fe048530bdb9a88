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

//! Persistence of the accumulated sync data.
//!
//! A [`PersistenceBackend`] stores the snapshot of a [`SyncAccumulator`]
//! along with a few other pieces of client data. The [`DegradableStore`]
//! wraps a backend and falls back to the in-memory [`MemoryStore`] the first
//! time the backend fails, so callers never have to handle storage errors.
//!
//! [`SyncAccumulator`]: crate::SyncAccumulator

use async_trait::async_trait;
use matrix_client_common::AsyncTraitDeps;
use ruma::{OwnedUserId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{accumulator::SavedSync, error::Result, sync::SyncResponse};

mod degradable;
#[cfg(any(test, feature = "testing"))]
#[macro_use]
pub mod integration_tests;
mod memory_store;
mod remote;
#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteSyncBackend;
pub use self::{
    degradable::{DegradableStore, StoreEvent, StoreState},
    memory_store::MemoryStore,
    remote::{BackendWorker, RemoteBackend, WorkerCommand, WorkerReply, WorkerRequest, WorkerResponse},
};

/// The latest presence event of a user, as written to the backend.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PresenceTuple {
    pub user_id: OwnedUserId,
    pub event: JsonValue,
}

/// The durable storage behind a [`DegradableStore`].
///
/// Backends own the sync accumulator whose snapshot they persist: sync
/// responses are given to them with [`set_sync_data`], and
/// [`sync_to_database`] writes the current snapshot out.
///
/// [`set_sync_data`]: PersistenceBackend::set_sync_data
/// [`sync_to_database`]: PersistenceBackend::sync_to_database
#[async_trait]
pub trait PersistenceBackend: AsyncTraitDeps {
    /// Open the underlying storage, creating or migrating it if needed, and
    /// load the saved snapshot into the accumulator.
    async fn connect(&self) -> Result<()>;

    /// Whether the storage was created by the last [`connect`] call.
    ///
    /// [`connect`]: PersistenceBackend::connect
    async fn is_newly_created(&self) -> Result<bool>;

    /// The current snapshot of the accumulator, if anything was accumulated
    /// or loaded.
    async fn saved_sync(&self) -> Result<Option<SavedSync>>;

    /// The sync token of the current snapshot.
    async fn next_batch_token(&self) -> Result<Option<String>>;

    /// Give a new sync response to the accumulator of the backend.
    ///
    /// This doesn't write anything, see [`sync_to_database`].
    ///
    /// [`sync_to_database`]: PersistenceBackend::sync_to_database
    async fn set_sync_data(&self, response: &SyncResponse) -> Result<()>;

    /// Write the current snapshot and the given presence events.
    async fn sync_to_database(&self, presence: Vec<PresenceTuple>) -> Result<()>;

    /// All the presence events that were written.
    async fn user_presence_events(&self) -> Result<Vec<PresenceTuple>>;

    /// The lazily loaded members of a room.
    ///
    /// `None` means they were never fetched, an empty list means the room has
    /// no such members.
    async fn get_out_of_band_members(&self, room_id: &RoomId) -> Result<Option<Vec<JsonValue>>>;

    /// Store the lazily loaded members of a room.
    async fn set_out_of_band_members(&self, room_id: &RoomId, members: Vec<JsonValue>)
        -> Result<()>;

    /// Forget the lazily loaded members of a room.
    async fn clear_out_of_band_members(&self, room_id: &RoomId) -> Result<()>;

    /// Delete everything that was written, and reset the accumulator.
    async fn clear_database(&self) -> Result<()>;

    /// The client options that were stored.
    async fn get_client_options(&self) -> Result<Option<JsonValue>>;

    /// Store the client options.
    async fn store_client_options(&self, options: JsonValue) -> Result<()>;
}
