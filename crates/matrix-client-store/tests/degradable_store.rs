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
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use assert_matches2::assert_let;
use async_trait::async_trait;
use matrix_client_store::{
    store::{DegradableStore, PersistenceBackend, PresenceTuple, SqliteSyncBackend, StoreEvent},
    Result, SavedSync, StoreConfig, StoreError, SyncResponse,
};
use matrix_client_test::{
    JoinedRoomBuilder, SyncResponseBuilder, ALICE, BOB, DEFAULT_TEST_ROOM_ID,
};
use ruma::RoomId;
use serde_json::{json, Value as JsonValue};
use tempfile::tempdir;

matrix_client_test::init_tracing_for_tests!();

#[derive(Debug, Default)]
struct Counters {
    failing: AtomicBool,
    fail_clear: AtomicBool,
    calls: Mutex<BTreeMap<&'static str, usize>>,
    total: AtomicUsize,
    last_presence_written: Mutex<Option<Vec<PresenceTuple>>>,
}

/// A backend counting its calls, which fails every call once `failing` is
/// set.
#[derive(Clone, Debug, Default)]
struct CountingBackend(Arc<Counters>);

impl CountingBackend {
    fn record(&self, operation: &'static str) -> Result<()> {
        self.0.total.fetch_add(1, Ordering::SeqCst);
        *self.0.calls.lock().unwrap().entry(operation).or_default() += 1;

        let failing = if operation == "clear_database" {
            self.0.fail_clear.load(Ordering::SeqCst)
        } else {
            self.0.failing.load(Ordering::SeqCst)
        };

        if failing {
            Err(StoreError::InvalidData(format!("{operation} failed")))
        } else {
            Ok(())
        }
    }

    fn set_failing(&self) {
        self.0.failing.store(true, Ordering::SeqCst);
    }

    fn calls(&self, operation: &str) -> usize {
        self.0.calls.lock().unwrap().get(operation).copied().unwrap_or_default()
    }

    fn total(&self) -> usize {
        self.0.total.load(Ordering::SeqCst)
    }

    fn last_presence_written(&self) -> Option<Vec<PresenceTuple>> {
        self.0.last_presence_written.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceBackend for CountingBackend {
    async fn connect(&self) -> Result<()> {
        self.record("connect")
    }

    async fn is_newly_created(&self) -> Result<bool> {
        self.record("is_newly_created").map(|()| false)
    }

    async fn saved_sync(&self) -> Result<Option<SavedSync>> {
        self.record("saved_sync").map(|()| None)
    }

    async fn next_batch_token(&self) -> Result<Option<String>> {
        self.record("next_batch_token").map(|()| Some("from_backend".to_owned()))
    }

    async fn set_sync_data(&self, _: &SyncResponse) -> Result<()> {
        self.record("set_sync_data")
    }

    async fn sync_to_database(&self, presence: Vec<PresenceTuple>) -> Result<()> {
        self.record("sync_to_database")?;
        *self.0.last_presence_written.lock().unwrap() = Some(presence);
        Ok(())
    }

    async fn user_presence_events(&self) -> Result<Vec<PresenceTuple>> {
        self.record("user_presence_events").map(|()| Vec::new())
    }

    async fn get_out_of_band_members(&self, _: &RoomId) -> Result<Option<Vec<JsonValue>>> {
        self.record("get_out_of_band_members").map(|()| None)
    }

    async fn set_out_of_band_members(&self, _: &RoomId, _: Vec<JsonValue>) -> Result<()> {
        self.record("set_out_of_band_members")
    }

    async fn clear_out_of_band_members(&self, _: &RoomId) -> Result<()> {
        self.record("clear_out_of_band_members")
    }

    async fn clear_database(&self) -> Result<()> {
        self.record("clear_database")
    }

    async fn get_client_options(&self) -> Result<Option<JsonValue>> {
        self.record("get_client_options").map(|()| None)
    }

    async fn store_client_options(&self, _: JsonValue) -> Result<()> {
        self.record("store_client_options")
    }
}

fn sync_response(builder: &mut SyncResponseBuilder) -> SyncResponse {
    SyncResponse::from_json(builder.build_json_sync_response()).unwrap()
}

#[tokio::test]
async fn test_first_failure_degrades_the_store_once() {
    let backend = CountingBackend::default();
    let store = DegradableStore::new(backend.clone(), StoreConfig::default());
    let mut events = store.subscribe_to_events();

    store.startup().await;
    assert!(!store.is_degraded());
    assert_eq!(store.saved_sync_token().await.as_deref(), Some("from_backend"));

    backend.set_failing();

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(JoinedRoomBuilder::new(&DEFAULT_TEST_ROOM_ID));
    let response = sync_response(&mut builder);

    // The failing call is served by memory, the caller doesn't notice.
    store.set_sync_data(&response).await;
    assert!(store.is_degraded());
    assert_eq!(backend.calls("set_sync_data"), 1);
    assert_eq!(backend.calls("clear_database"), 1);

    let calls_after_degrading = backend.total();

    assert_eq!(store.saved_sync_token().await, Some(response.next_batch.clone()));
    assert!(store.saved_sync().await.is_none());
    assert!(store.is_newly_created().await);
    assert!(!store.wants_save());

    store.save(true).await;
    store.set_out_of_band_members(&DEFAULT_TEST_ROOM_ID, vec![json!({ "a": 1 })]).await;
    assert_eq!(
        store.get_out_of_band_members(&DEFAULT_TEST_ROOM_ID).await,
        Some(vec![json!({ "a": 1 })])
    );
    store.clear_out_of_band_members(&DEFAULT_TEST_ROOM_ID).await;
    assert_eq!(store.get_out_of_band_members(&DEFAULT_TEST_ROOM_ID).await, None);
    store.store_client_options(json!({ "lazy_load_members": true })).await;
    assert_eq!(store.get_client_options().await, Some(json!({ "lazy_load_members": true })));
    store.delete_all_data().await;

    assert_eq!(backend.total(), calls_after_degrading, "the backend must not be used anymore");

    assert_let!(Ok(StoreEvent::Degraded { operation, reason }) = events.try_recv());
    assert_eq!(operation, "set_sync_data");
    assert!(reason.contains("set_sync_data failed"));
    assert!(events.try_recv().is_err(), "only one event is sent");
}

#[tokio::test]
async fn test_failing_cleanup_is_swallowed() {
    let backend = CountingBackend::default();
    backend.set_failing();
    backend.0.fail_clear.store(true, Ordering::SeqCst);

    let store = DegradableStore::new(backend.clone(), StoreConfig::default());

    store.startup().await;

    assert!(store.is_degraded());
    assert_eq!(backend.calls("connect"), 1);
    assert_eq!(backend.calls("clear_database"), 1);
    assert_eq!(store.saved_sync_token().await, None);
}

#[tokio::test]
async fn test_only_changed_presence_is_saved() {
    let backend = CountingBackend::default();
    let store = DegradableStore::new(backend.clone(), StoreConfig::default());
    store.startup().await;

    let alice_presence = json!({ "sender": *ALICE, "content": { "presence": "online" } });
    store.set_presence(&ALICE, alice_presence.clone());
    store.save(true).await;

    assert_let!(Some(written) = backend.last_presence_written());
    assert_eq!(written, vec![PresenceTuple { user_id: ALICE.to_owned(), event: alice_presence }]);

    // Nothing changed, a forced save still writes the snapshot.
    store.save(true).await;
    assert_eq!(backend.calls("sync_to_database"), 2);
    assert_let!(Some(written) = backend.last_presence_written());
    assert!(written.is_empty());

    let bob_presence = json!({ "sender": *BOB, "content": { "presence": "offline" } });
    store.set_presence(&BOB, bob_presence.clone());
    store.save(true).await;

    assert_let!(Some(written) = backend.last_presence_written());
    assert_eq!(written, vec![PresenceTuple { user_id: BOB.to_owned(), event: bob_presence }]);
    assert!(!store.is_degraded());
}

#[tokio::test]
async fn test_sqlite_store_survives_a_restart() {
    let dir = tempdir().unwrap();

    let mut builder = SyncResponseBuilder::new();
    builder
        .add_joined_room(JoinedRoomBuilder::new(&DEFAULT_TEST_ROOM_ID))
        .add_presence_event(&BOB, "online");
    let response = sync_response(&mut builder);

    {
        let backend = SqliteSyncBackend::open(dir.path(), &StoreConfig::default()).unwrap();
        let store = DegradableStore::new(backend, StoreConfig::default());
        store.startup().await;
        assert!(store.is_newly_created().await);

        store.set_sync_data(&response).await;
        store.save(false).await;
        assert!(!store.wants_save());
        assert!(!store.is_degraded());
    }

    let backend = SqliteSyncBackend::open(dir.path(), &StoreConfig::default()).unwrap();
    let store = DegradableStore::new(backend, StoreConfig::default());
    store.startup().await;

    assert!(!store.is_newly_created().await);
    assert_eq!(store.saved_sync_token().await, Some(response.next_batch.clone()));

    let saved = store.saved_sync().await.unwrap();
    assert!(saved.rooms.join.contains_key(*DEFAULT_TEST_ROOM_ID));

    assert_let!(Some(presence) = store.presence(&BOB));
    assert_eq!(presence["content"]["presence"], "online");
}
