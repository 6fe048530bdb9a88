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

use async_trait::async_trait;
use deadpool_sqlite::Object as SqliteAsyncConn;
use rusqlite::{OptionalExtension, Transaction};

use crate::error::{Result, StoreError};

#[async_trait]
pub(super) trait SqliteAsyncConnExt {
    async fn execute_batch(&self, sql: &'static str) -> Result<()>;

    async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static;
}

#[async_trait]
impl SqliteAsyncConnExt for SqliteAsyncConn {
    async fn execute_batch(&self, sql: &'static str) -> Result<()> {
        self.interact(move |conn| conn.execute_batch(sql))
            .await
            .map_err(|error| StoreError::Interact(format!("{error:?}")))??;

        Ok(())
    }

    async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
    {
        self.interact(move |conn| {
            let txn = conn.transaction()?;
            let result = f(&txn)?;
            txn.commit()?;
            Ok(result)
        })
        .await
        .map_err(|error| StoreError::Interact(format!("{error:?}")))?
    }
}

pub(super) trait SqliteConnectionExt {
    fn get_kv(&self, key: &str) -> rusqlite::Result<Option<Vec<u8>>>;

    fn set_kv(&self, key: &str, value: &[u8]) -> rusqlite::Result<()>;
}

impl SqliteConnectionExt for rusqlite::Connection {
    fn get_kv(&self, key: &str) -> rusqlite::Result<Option<Vec<u8>>> {
        self.query_row("SELECT value FROM kv WHERE key = ?", (key,), |row| row.get(0)).optional()
    }

    fn set_kv(&self, key: &str, value: &[u8]) -> rusqlite::Result<()> {
        self.execute(
            "INSERT INTO kv VALUES (?1, ?2) ON CONFLICT (key) DO UPDATE SET value = ?2",
            (key, value),
        )?;
        Ok(())
    }
}

/// Load the version of the database.
///
/// A database without the `kv` table has version 0.
pub(super) fn load_db_version(conn: &rusqlite::Connection) -> Result<u8> {
    let kv_exists = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'kv'",
        (),
        |row| row.get::<_, u32>(0),
    )? > 0;

    if kv_exists {
        match conn.get_kv("version")?.as_deref() {
            Some([v]) => Ok(*v),
            Some(_) => Err(StoreError::InvalidData("the database version is invalid".to_owned())),
            None => Err(StoreError::InvalidData("the database version is missing".to_owned())),
        }
    } else {
        Ok(0)
    }
}
