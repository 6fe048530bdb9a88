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

use thiserror::Error;

/// Store specific error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// An error happened in the underlying database backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// An error happened while serializing or deserializing some data.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An error happened while deserializing a Matrix identifier, e.g. an user
    /// id.
    #[error(transparent)]
    Identifier(#[from] ruma::IdParseError),

    /// Failed to create the directory of the database.
    #[error("Failed to create the database's parent directory")]
    CreateDir(#[source] std::io::Error),

    /// Failed to create the database connection pool.
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    CreatePool(#[from] deadpool_sqlite::CreatePoolError),

    /// Failed to get a database connection from the pool.
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Pool(#[from] deadpool_sqlite::PoolError),

    /// A SQLite query failed.
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// The task running a database interaction panicked or got aborted.
    #[error("Failed to interact with the database connection: {0}")]
    Interact(String),

    /// Failed to apply the schema migrations.
    #[error("Failed to run migrations: {0}")]
    Migration(String),

    /// The database format has changed in a backwards incompatible way.
    #[error(
        "The database format changed in an incompatible way, current \
        version: {0}, latest version: {1}"
    )]
    UnsupportedDatabaseVersion(u8, u8),

    /// The backend was used before it was connected.
    #[error("The backend was used before being connected")]
    NotConnected,

    /// The channel to the remote store worker is closed.
    #[error("The store worker went away")]
    WorkerGone,

    /// The remote store worker reported an error.
    #[error("The store worker failed: {0}")]
    Remote(String),

    /// Data read from the store, or received from the worker, has an
    /// unexpected shape.
    #[error("Invalid data in the store: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `StoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// Errors for sync payloads that can't be accumulated at all.
///
/// Malformed rooms or events never produce this error, they are skipped.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The payload isn't a JSON object, or lacks its `next_batch` token.
    #[error("Invalid sync response: {0}")]
    InvalidResponse(#[source] serde_json::Error),
}

/// A `Result` type alias with [`StoreError`] as the default error type.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
