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

//! Macro of integration tests for `PersistenceBackend` implementations.

/// Macro building to allow your `PersistenceBackend` implementation to run
/// the entire tests suite locally.
///
/// You need to provide a `async fn get_backend() -> Result<impl
/// PersistenceBackend>` providing a fresh, not yet connected, backend on the
/// same level you invoke the macro.
///
/// ## Usage Example:
/// ```no_run
/// # use matrix_client_store::{
/// #    store::{PersistenceBackend, SqliteSyncBackend as MyBackend},
/// #    Result, StoreConfig,
/// # };
///
/// #[cfg(test)]
/// mod tests {
///     use super::{MyBackend, PersistenceBackend, Result, StoreConfig};
///
///     async fn get_backend() -> Result<impl PersistenceBackend> {
///         MyBackend::open("/tmp/store", &StoreConfig::default())
///     }
///
///     persistence_backend_integration_tests! { integration }
/// }
/// ```
#[allow(unused_macros, unused_extern_crates)]
#[macro_export]
macro_rules! persistence_backend_integration_tests {
    ($($name:ident)*) => {
        $(
            mod $name {
                use ruma::{room_id, user_id};
                use serde_json::json;

                use $crate::{
                    store::{PersistenceBackend, PresenceTuple},
                    SyncResponse,
                };

                use super::get_backend;

                async fn connected_backend() -> impl PersistenceBackend {
                    let backend = get_backend().await.unwrap();
                    backend.connect().await.unwrap();
                    backend
                }

                fn sync_response(next_batch: &str) -> SyncResponse {
                    SyncResponse::from_json(json!({
                        "next_batch": next_batch,
                        "rooms": {
                            "join": {
                                "!room:example.org": {
                                    "state": {
                                        "events": [{
                                            "type": "m.room.name",
                                            "state_key": "",
                                            "sender": "@alice:example.org",
                                            "content": { "name": "Room" },
                                        }],
                                    },
                                    "timeline": { "events": [], "prev_batch": "p1" },
                                },
                            },
                        },
                        "account_data": {
                            "events": [{ "type": "m.push_rules", "content": {} }],
                        },
                    }))
                    .unwrap()
                }

                #[tokio::test]
                async fn test_fresh_backend() {
                    let backend = connected_backend().await;

                    assert!(backend.is_newly_created().await.unwrap());
                    assert!(backend.saved_sync().await.unwrap().is_none());
                    assert!(backend.next_batch_token().await.unwrap().is_none());
                    assert!(backend.user_presence_events().await.unwrap().is_empty());
                    assert!(backend.get_client_options().await.unwrap().is_none());
                }

                #[tokio::test]
                async fn test_sync_data_is_accumulated() {
                    let backend = connected_backend().await;

                    backend.set_sync_data(&sync_response("s1")).await.unwrap();
                    backend.set_sync_data(&sync_response("s2")).await.unwrap();

                    assert_eq!(backend.next_batch_token().await.unwrap().as_deref(), Some("s2"));

                    let saved = backend.saved_sync().await.unwrap().unwrap();
                    assert_eq!(saved.next_batch, "s2");
                    assert_eq!(saved.account_data.events.len(), 1);

                    let room = &saved.rooms.join[room_id!("!room:example.org")];
                    assert_eq!(room.state.events.len(), 1);
                    assert_eq!(room.state.events[0]["content"]["name"], "Room");
                }

                #[tokio::test]
                async fn test_presence_is_written() {
                    let backend = connected_backend().await;
                    let user_id = user_id!("@alice:example.org");

                    let presence = |state: &str| PresenceTuple {
                        user_id: user_id.to_owned(),
                        event: json!({
                            "type": "m.presence",
                            "sender": user_id,
                            "content": { "presence": state },
                        }),
                    };

                    backend.sync_to_database(vec![presence("online")]).await.unwrap();
                    backend.sync_to_database(vec![presence("unavailable")]).await.unwrap();

                    let events = backend.user_presence_events().await.unwrap();
                    assert_eq!(events, vec![presence("unavailable")]);
                }

                #[tokio::test]
                async fn test_out_of_band_members() {
                    let backend = connected_backend().await;
                    let room_id = room_id!("!room:example.org");

                    assert!(backend.get_out_of_band_members(room_id).await.unwrap().is_none());

                    backend.set_out_of_band_members(room_id, Vec::new()).await.unwrap();
                    assert_eq!(
                        backend.get_out_of_band_members(room_id).await.unwrap(),
                        Some(Vec::new())
                    );

                    let member = json!({
                        "type": "m.room.member",
                        "state_key": "@bob:example.org",
                        "content": { "membership": "join" },
                    });
                    backend.set_out_of_band_members(room_id, vec![member.clone()]).await.unwrap();
                    assert_eq!(
                        backend.get_out_of_band_members(room_id).await.unwrap(),
                        Some(vec![member])
                    );

                    backend.clear_out_of_band_members(room_id).await.unwrap();
                    assert!(backend.get_out_of_band_members(room_id).await.unwrap().is_none());
                }

                #[tokio::test]
                async fn test_client_options() {
                    let backend = connected_backend().await;
                    let options = json!({ "lazy_load_members": true });

                    backend.store_client_options(options.clone()).await.unwrap();
                    assert_eq!(backend.get_client_options().await.unwrap(), Some(options));
                }

                #[tokio::test]
                async fn test_clear_database() {
                    let backend = connected_backend().await;
                    let room_id = room_id!("!room:example.org");

                    backend.set_sync_data(&sync_response("s1")).await.unwrap();
                    backend.sync_to_database(vec![PresenceTuple {
                        user_id: user_id!("@alice:example.org").to_owned(),
                        event: json!({ "type": "m.presence", "content": {} }),
                    }])
                    .await
                    .unwrap();
                    backend.set_out_of_band_members(room_id, Vec::new()).await.unwrap();
                    backend.store_client_options(json!({})).await.unwrap();

                    backend.clear_database().await.unwrap();

                    assert!(backend.saved_sync().await.unwrap().is_none());
                    assert!(backend.next_batch_token().await.unwrap().is_none());
                    assert!(backend.user_presence_events().await.unwrap().is_empty());
                    assert!(backend.get_out_of_band_members(room_id).await.unwrap().is_none());
                    assert!(backend.get_client_options().await.unwrap().is_none());
                }
            }
        )*
    };
}
