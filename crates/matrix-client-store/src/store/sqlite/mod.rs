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

//! A [`PersistenceBackend`] storing the sync snapshot in a SQLite database.

use std::{
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use deadpool_sqlite::{Object as SqliteAsyncConn, Pool as SqlitePool, Runtime};
use rusqlite::OptionalExtension;
use ruma::{RoomId, UserId};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use self::utils::{load_db_version, SqliteAsyncConnExt, SqliteConnectionExt};
use super::{PersistenceBackend, PresenceTuple};
use crate::{
    accumulator::{SavedSync, SyncAccumulator},
    config::StoreConfig,
    error::{Result, StoreError},
    sync::SyncResponse,
};

mod utils;

mod keys {
    pub const VERSION: &str = "version";
    pub const SYNC: &str = "sync";
    pub const CLIENT_OPTIONS: &str = "client_options";
}

/// Identifier of the latest database version.
///
/// This is used to figure whether the sqlite database requires a migration.
const DATABASE_VERSION: u8 = 1;

/// The name of the database file, in the directory given to
/// [`SqliteSyncBackend::open`].
const DATABASE_NAME: &str = "matrix-client-sync.sqlite3";

/// A SQLite based [`PersistenceBackend`].
///
/// The backend owns the [`SyncAccumulator`] whose snapshot it writes. The
/// snapshot is loaded back into the accumulator by [`connect`].
///
/// [`connect`]: PersistenceBackend::connect
pub struct SqliteSyncBackend {
    pool: SqlitePool,
    accumulator: Mutex<SyncAccumulator>,
    connected: AtomicBool,
    newly_created: AtomicBool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SqliteSyncBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteSyncBackend")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SqliteSyncBackend {
    /// Create a backend storing its database in the given directory.
    ///
    /// Nothing is read or written until [`connect`] is called.
    ///
    /// [`connect`]: PersistenceBackend::connect
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(StoreError::CreateDir)?;

        let cfg = deadpool_sqlite::Config::new(path.join(DATABASE_NAME));
        let pool = cfg.create_pool(Runtime::Tokio1)?;

        Ok(Self::with_pool(pool, config))
    }

    /// Create a backend using the given sqlite database pool.
    pub fn with_pool(pool: SqlitePool, config: &StoreConfig) -> Self {
        Self {
            pool,
            accumulator: Mutex::new(SyncAccumulator::new(config.max_timeline_entries)),
            connected: AtomicBool::new(false),
            newly_created: AtomicBool::new(false),
        }
    }

    fn accumulator(&self) -> MutexGuard<'_, SyncAccumulator> {
        self.accumulator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connection(&self) -> Result<SqliteAsyncConn> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::NotConnected);
        }

        Ok(self.pool.get().await?)
    }
}

/// Create the schema if the database is new.
///
/// Returns whether the schema was created.
async fn run_migrations(conn: &SqliteAsyncConn) -> Result<bool> {
    // This can't be done in the transaction, it fails with the error message:
    // "cannot change into wal mode from within a transaction".
    conn.execute_batch("PRAGMA journal_mode = wal;").await?;

    conn.with_transaction(|txn| {
        let version = load_db_version(txn)?;

        if version > DATABASE_VERSION {
            return Err(StoreError::UnsupportedDatabaseVersion(version, DATABASE_VERSION));
        }

        if version == 0 {
            debug!(new_version = DATABASE_VERSION, "Creating the database");

            txn.execute_batch(include_str!("../../../migrations/001_init.sql"))
                .map_err(|error| StoreError::Migration(error.to_string()))?;
            txn.set_kv(keys::VERSION, &[DATABASE_VERSION])?;

            return Ok(true);
        }

        Ok(false)
    })
    .await
}

#[async_trait]
impl PersistenceBackend for SqliteSyncBackend {
    #[instrument(skip_all)]
    async fn connect(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        let newly_created = run_migrations(&conn).await?;
        self.newly_created.store(newly_created, Ordering::SeqCst);

        let saved = conn.with_transaction(|txn| Ok(txn.get_kv(keys::SYNC)?)).await?;

        if let Some(saved) = saved {
            let saved: SavedSync = serde_json::from_slice(&saved)?;
            debug!(next_batch = %saved.next_batch, "Loaded the saved sync");

            self.accumulator().accumulate_from_database(saved);
        }

        self.connected.store(true, Ordering::SeqCst);

        Ok(())
    }

    async fn is_newly_created(&self) -> Result<bool> {
        Ok(self.newly_created.load(Ordering::SeqCst))
    }

    async fn saved_sync(&self) -> Result<Option<SavedSync>> {
        Ok(self.accumulator().saved_sync())
    }

    async fn next_batch_token(&self) -> Result<Option<String>> {
        Ok(self.accumulator().next_batch_token().map(ToOwned::to_owned))
    }

    async fn set_sync_data(&self, response: &SyncResponse) -> Result<()> {
        self.accumulator().accumulate(response);
        Ok(())
    }

    #[instrument(skip_all, fields(presence = presence.len()))]
    async fn sync_to_database(&self, presence: Vec<PresenceTuple>) -> Result<()> {
        let conn = self.connection().await?;

        let sync = serde_json::to_vec(&self.accumulator().get_json(true))?;
        let users = presence
            .into_iter()
            .map(|tuple| Ok((tuple.user_id.to_string(), serde_json::to_vec(&tuple.event)?)))
            .collect::<Result<Vec<_>>>()?;

        conn.with_transaction(move |txn| {
            txn.set_kv(keys::SYNC, &sync)?;

            for (user_id, event) in &users {
                txn.execute(
                    "INSERT INTO users (user_id, event) VALUES (?1, ?2) \
                     ON CONFLICT (user_id) DO UPDATE SET event = ?2",
                    (user_id, event),
                )?;
            }

            Ok(())
        })
        .await?;

        debug!("Wrote the sync snapshot");

        Ok(())
    }

    async fn user_presence_events(&self) -> Result<Vec<PresenceTuple>> {
        let conn = self.connection().await?;

        let rows = conn
            .with_transaction(|txn| {
                let mut statement = txn.prepare("SELECT user_id, event FROM users")?;
                let rows = statement
                    .query_map((), |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(user_id, event)| {
                Ok(PresenceTuple {
                    user_id: UserId::parse(user_id)?,
                    event: serde_json::from_slice(&event)?,
                })
            })
            .collect()
    }

    async fn get_out_of_band_members(&self, room_id: &RoomId) -> Result<Option<Vec<JsonValue>>> {
        let conn = self.connection().await?;
        let room_id = room_id.to_string();

        let members = conn
            .with_transaction(move |txn| {
                Ok(txn
                    .query_row(
                        "SELECT events FROM oob_members WHERE room_id = ?",
                        (room_id,),
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()?)
            })
            .await?;

        members.map(|members| Ok(serde_json::from_slice(&members)?)).transpose()
    }

    async fn set_out_of_band_members(
        &self,
        room_id: &RoomId,
        members: Vec<JsonValue>,
    ) -> Result<()> {
        let conn = self.connection().await?;
        let room_id = room_id.to_string();
        let members = serde_json::to_vec(&members)?;

        conn.with_transaction(move |txn| {
            txn.execute(
                "INSERT INTO oob_members (room_id, events) VALUES (?1, ?2) \
                 ON CONFLICT (room_id) DO UPDATE SET events = ?2",
                (room_id, members),
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_out_of_band_members(&self, room_id: &RoomId) -> Result<()> {
        let conn = self.connection().await?;
        let room_id = room_id.to_string();

        conn.with_transaction(move |txn| {
            txn.execute("DELETE FROM oob_members WHERE room_id = ?", (room_id,))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip_all)]
    async fn clear_database(&self) -> Result<()> {
        self.accumulator().clear();

        let conn = self.connection().await?;
        conn.with_transaction(|txn| {
            txn.execute("DELETE FROM kv WHERE key != ?", (keys::VERSION,))?;
            txn.execute_batch("DELETE FROM users; DELETE FROM oob_members;")?;
            Ok(())
        })
        .await?;

        debug!("Cleared the database");

        Ok(())
    }

    async fn get_client_options(&self) -> Result<Option<JsonValue>> {
        let conn = self.connection().await?;

        let options =
            conn.with_transaction(|txn| Ok(txn.get_kv(keys::CLIENT_OPTIONS)?)).await?;

        options.map(|options| Ok(serde_json::from_slice(&options)?)).transpose()
    }

    async fn store_client_options(&self, options: JsonValue) -> Result<()> {
        let conn = self.connection().await?;
        let options = serde_json::to_vec(&options)?;

        conn.with_transaction(move |txn| Ok(txn.set_kv(keys::CLIENT_OPTIONS, &options)?)).await
    }
}
