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

//! A [`PersistenceBackend`] running on the other end of a message channel.
//!
//! Every call of the [`RemoteBackend`] becomes a [`WorkerRequest`] tagged
//! with a sequence number. The [`BackendWorker`] runs the request against
//! the real backend and answers with a [`WorkerResponse`] carrying the same
//! sequence number, which is how responses find their caller again. All the
//! messages are serializable so the worker can live in another thread or
//! process.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use matrix_client_common::executor::{spawn, AbortOnDrop, JoinHandleExt};
use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use super::{PersistenceBackend, PresenceTuple};
use crate::{
    accumulator::SavedSync,
    error::{Result, StoreError},
    sync::SyncResponse,
};

/// A [`PersistenceBackend`] operation, sent to the worker.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum WorkerCommand {
    Connect,
    IsNewlyCreated,
    GetSavedSync,
    GetNextBatchToken,
    SetSyncData(Box<SyncResponse>),
    SyncToDatabase(Vec<PresenceTuple>),
    GetUserPresenceEvents,
    GetOutOfBandMembers(OwnedRoomId),
    SetOutOfBandMembers { room_id: OwnedRoomId, members: Vec<JsonValue> },
    ClearOutOfBandMembers(OwnedRoomId),
    ClearDatabase,
    GetClientOptions,
    StoreClientOptions(JsonValue),
}

/// The successful result of a [`WorkerCommand`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WorkerReply {
    Done,
    Bool(bool),
    SavedSync(Option<Box<SavedSync>>),
    Token(Option<String>),
    Presence(Vec<PresenceTuple>),
    Members(Option<Vec<JsonValue>>),
    ClientOptions(Option<JsonValue>),
}

/// A request to the worker.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerRequest {
    pub seq: u64,
    #[serde(flatten)]
    pub command: WorkerCommand,
}

/// The answer of the worker to the request with the same `seq`.
///
/// Errors are sent as their message.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerResponse {
    pub seq: u64,
    pub result: Result<WorkerReply, String>,
}

type ReplySender = oneshot::Sender<Result<WorkerReply, String>>;

#[derive(Default)]
struct PendingRequests {
    /// Set once the response channel is closed, no reply will come anymore.
    closed: bool,
    senders: HashMap<u64, ReplySender>,
}

fn lock(pending: &Mutex<PendingRequests>) -> MutexGuard<'_, PendingRequests> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`PersistenceBackend`] forwarding every call to a [`BackendWorker`].
///
/// A closed channel, in either direction, makes every pending and future
/// call fail with [`StoreError::WorkerGone`].
pub struct RemoteBackend {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    pending: Arc<Mutex<PendingRequests>>,
    next_seq: AtomicU64,
    _responses_task: AbortOnDrop<()>,
    _worker_task: Option<AbortOnDrop<()>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("next_seq", &self.next_seq.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl RemoteBackend {
    /// Create a backend talking to a worker through the given channels.
    ///
    /// This spawns the task routing the responses to their callers, so it
    /// must be called from within a tokio runtime.
    pub fn new(
        requests: mpsc::UnboundedSender<WorkerRequest>,
        responses: mpsc::UnboundedReceiver<WorkerResponse>,
    ) -> Self {
        let pending = Arc::new(Mutex::new(PendingRequests::default()));
        let responses_task = spawn(route_responses(pending.clone(), responses)).abort_on_drop();

        Self {
            requests,
            pending,
            next_seq: AtomicU64::new(0),
            _responses_task: responses_task,
            _worker_task: None,
        }
    }

    /// Spawn a [`BackendWorker`] for the given backend and connect to it.
    ///
    /// The worker stops when the returned `RemoteBackend` is dropped.
    pub fn spawn_worker<B: PersistenceBackend + 'static>(backend: B) -> Self {
        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        let (response_sender, response_receiver) = mpsc::unbounded_channel();

        let worker = BackendWorker::new(backend);
        let worker_task = spawn(worker.run(request_receiver, response_sender)).abort_on_drop();

        let mut this = Self::new(request_sender, response_receiver);
        this._worker_task = Some(worker_task);
        this
    }

    async fn call(&self, command: WorkerCommand) -> Result<WorkerReply> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();

        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(StoreError::WorkerGone);
            }
            pending.senders.insert(seq, sender);
        }

        trace!(seq, ?command, "Sending a request to the store worker");

        if self.requests.send(WorkerRequest { seq, command }).is_err() {
            lock(&self.pending).senders.remove(&seq);
            return Err(StoreError::WorkerGone);
        }

        match receiver.await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(message)) => Err(StoreError::Remote(message)),
            Err(_) => Err(StoreError::WorkerGone),
        }
    }
}

/// Hand the responses of the worker to the callers waiting for them.
async fn route_responses(
    pending: Arc<Mutex<PendingRequests>>,
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
) {
    while let Some(WorkerResponse { seq, result }) = responses.recv().await {
        let sender = lock(&pending).senders.remove(&seq);

        match sender {
            Some(sender) => {
                // The caller may have given up waiting.
                let _ = sender.send(result);
            }
            None => warn!(seq, "Received a response to an unknown store worker request"),
        }
    }

    debug!("The store worker closed its channel");

    // Dropping the senders wakes up every caller with an error.
    let mut pending = lock(&pending);
    pending.closed = true;
    pending.senders.clear();
}

fn unexpected_reply(reply: WorkerReply) -> StoreError {
    StoreError::InvalidData(format!("unexpected reply from the store worker: {reply:?}"))
}

#[async_trait]
impl PersistenceBackend for RemoteBackend {
    async fn connect(&self) -> Result<()> {
        match self.call(WorkerCommand::Connect).await? {
            WorkerReply::Done => Ok(()),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn is_newly_created(&self) -> Result<bool> {
        match self.call(WorkerCommand::IsNewlyCreated).await? {
            WorkerReply::Bool(newly_created) => Ok(newly_created),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn saved_sync(&self) -> Result<Option<SavedSync>> {
        match self.call(WorkerCommand::GetSavedSync).await? {
            WorkerReply::SavedSync(saved) => Ok(saved.map(|saved| *saved)),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn next_batch_token(&self) -> Result<Option<String>> {
        match self.call(WorkerCommand::GetNextBatchToken).await? {
            WorkerReply::Token(token) => Ok(token),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn set_sync_data(&self, response: &SyncResponse) -> Result<()> {
        match self.call(WorkerCommand::SetSyncData(Box::new(response.clone()))).await? {
            WorkerReply::Done => Ok(()),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn sync_to_database(&self, presence: Vec<PresenceTuple>) -> Result<()> {
        match self.call(WorkerCommand::SyncToDatabase(presence)).await? {
            WorkerReply::Done => Ok(()),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn user_presence_events(&self) -> Result<Vec<PresenceTuple>> {
        match self.call(WorkerCommand::GetUserPresenceEvents).await? {
            WorkerReply::Presence(presence) => Ok(presence),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn get_out_of_band_members(&self, room_id: &RoomId) -> Result<Option<Vec<JsonValue>>> {
        match self.call(WorkerCommand::GetOutOfBandMembers(room_id.to_owned())).await? {
            WorkerReply::Members(members) => Ok(members),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn set_out_of_band_members(
        &self,
        room_id: &RoomId,
        members: Vec<JsonValue>,
    ) -> Result<()> {
        let command = WorkerCommand::SetOutOfBandMembers { room_id: room_id.to_owned(), members };

        match self.call(command).await? {
            WorkerReply::Done => Ok(()),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn clear_out_of_band_members(&self, room_id: &RoomId) -> Result<()> {
        match self.call(WorkerCommand::ClearOutOfBandMembers(room_id.to_owned())).await? {
            WorkerReply::Done => Ok(()),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn clear_database(&self) -> Result<()> {
        match self.call(WorkerCommand::ClearDatabase).await? {
            WorkerReply::Done => Ok(()),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn get_client_options(&self) -> Result<Option<JsonValue>> {
        match self.call(WorkerCommand::GetClientOptions).await? {
            WorkerReply::ClientOptions(options) => Ok(options),
            reply => Err(unexpected_reply(reply)),
        }
    }

    async fn store_client_options(&self, options: JsonValue) -> Result<()> {
        match self.call(WorkerCommand::StoreClientOptions(options)).await? {
            WorkerReply::Done => Ok(()),
            reply => Err(unexpected_reply(reply)),
        }
    }
}

/// Runs [`WorkerRequest`]s against a backend, one at a time.
#[derive(Debug)]
pub struct BackendWorker<B> {
    backend: B,
}

impl<B: PersistenceBackend> BackendWorker<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Answer requests until either channel is closed.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
        responses: mpsc::UnboundedSender<WorkerResponse>,
    ) {
        while let Some(WorkerRequest { seq, command }) = requests.recv().await {
            trace!(seq, ?command, "Handling a store worker request");

            let result = self.handle(command).await.map_err(|error| error.to_string());

            if responses.send(WorkerResponse { seq, result }).is_err() {
                break;
            }
        }

        debug!("The store worker stopped");
    }

    async fn handle(&self, command: WorkerCommand) -> Result<WorkerReply> {
        let backend = &self.backend;

        Ok(match command {
            WorkerCommand::Connect => {
                backend.connect().await?;
                WorkerReply::Done
            }
            WorkerCommand::IsNewlyCreated => WorkerReply::Bool(backend.is_newly_created().await?),
            WorkerCommand::GetSavedSync => {
                WorkerReply::SavedSync(backend.saved_sync().await?.map(Box::new))
            }
            WorkerCommand::GetNextBatchToken => WorkerReply::Token(backend.next_batch_token().await?),
            WorkerCommand::SetSyncData(response) => {
                backend.set_sync_data(&response).await?;
                WorkerReply::Done
            }
            WorkerCommand::SyncToDatabase(presence) => {
                backend.sync_to_database(presence).await?;
                WorkerReply::Done
            }
            WorkerCommand::GetUserPresenceEvents => {
                WorkerReply::Presence(backend.user_presence_events().await?)
            }
            WorkerCommand::GetOutOfBandMembers(room_id) => {
                WorkerReply::Members(backend.get_out_of_band_members(&room_id).await?)
            }
            WorkerCommand::SetOutOfBandMembers { room_id, members } => {
                backend.set_out_of_band_members(&room_id, members).await?;
                WorkerReply::Done
            }
            WorkerCommand::ClearOutOfBandMembers(room_id) => {
                backend.clear_out_of_band_members(&room_id).await?;
                WorkerReply::Done
            }
            WorkerCommand::ClearDatabase => {
                backend.clear_database().await?;
                WorkerReply::Done
            }
            WorkerCommand::GetClientOptions => {
                WorkerReply::ClientOptions(backend.get_client_options().await?)
            }
            WorkerCommand::StoreClientOptions(options) => {
                backend.store_client_options(options).await?;
                WorkerReply::Done
            }
        })
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;
    use assert_matches2::assert_let;
    use once_cell::sync::Lazy;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::mpsc;

    use super::{RemoteBackend, WorkerCommand, WorkerReply, WorkerRequest, WorkerResponse};
    use crate::{
        config::StoreConfig,
        error::{Result, StoreError},
        store::{PersistenceBackend, SqliteSyncBackend},
    };

    static TMP_DIR: Lazy<TempDir> = Lazy::new(|| tempdir().unwrap());
    static NUM: AtomicU32 = AtomicU32::new(0);

    async fn get_backend() -> Result<impl PersistenceBackend> {
        let name = NUM.fetch_add(1, Ordering::SeqCst).to_string();
        let backend = SqliteSyncBackend::open(TMP_DIR.path().join(name), &StoreConfig::default())?;

        Ok(RemoteBackend::spawn_worker(backend))
    }

    persistence_backend_integration_tests! { integration }

    #[tokio::test]
    async fn test_responses_are_correlated_by_sequence_number() {
        let (request_sender, mut request_receiver) = mpsc::unbounded_channel();
        let (response_sender, response_receiver) = mpsc::unbounded_channel();
        let backend = RemoteBackend::new(request_sender, response_receiver);

        let worker = tokio::spawn(async move {
            let first: WorkerRequest = request_receiver.recv().await.unwrap();
            let second: WorkerRequest = request_receiver.recv().await.unwrap();

            assert_matches!(first.command, WorkerCommand::GetNextBatchToken);
            assert_matches!(second.command, WorkerCommand::GetClientOptions);

            // Answer in the reverse order.
            response_sender
                .send(WorkerResponse {
                    seq: second.seq,
                    result: Ok(WorkerReply::ClientOptions(Some(json!({ "a": 1 })))),
                })
                .unwrap();
            response_sender
                .send(WorkerResponse {
                    seq: first.seq,
                    result: Ok(WorkerReply::Token(Some("s1".to_owned()))),
                })
                .unwrap();
        });

        let (token, options) =
            tokio::join!(backend.next_batch_token(), backend.get_client_options());
        worker.await.unwrap();

        assert_eq!(token.unwrap().as_deref(), Some("s1"));
        assert_eq!(options.unwrap(), Some(json!({ "a": 1 })));
    }

    #[tokio::test]
    async fn test_worker_errors_are_forwarded() {
        let (request_sender, mut request_receiver) = mpsc::unbounded_channel();
        let (response_sender, response_receiver) = mpsc::unbounded_channel();
        let backend = RemoteBackend::new(request_sender, response_receiver);

        tokio::spawn(async move {
            let request: WorkerRequest = request_receiver.recv().await.unwrap();
            response_sender
                .send(WorkerResponse { seq: request.seq, result: Err("quota exceeded".to_owned()) })
                .unwrap();
        });

        assert_let!(Err(StoreError::Remote(message)) = backend.clear_database().await);
        assert_eq!(message, "quota exceeded");
    }

    #[tokio::test]
    async fn test_closed_channel_fails_pending_and_future_calls() {
        let (request_sender, mut request_receiver) = mpsc::unbounded_channel::<WorkerRequest>();
        let (response_sender, response_receiver) = mpsc::unbounded_channel();
        let backend = RemoteBackend::new(request_sender, response_receiver);

        tokio::spawn(async move {
            // Take the request, and go away without answering it.
            let _request = request_receiver.recv().await;
            drop(response_sender);
        });

        assert_matches!(backend.connect().await, Err(StoreError::WorkerGone));
        assert_matches!(backend.is_newly_created().await, Err(StoreError::WorkerGone));
    }

    #[test]
    fn test_requests_serialize_to_json() {
        let request = WorkerRequest {
            seq: 3,
            command: WorkerCommand::StoreClientOptions(json!({ "lazy_load_members": true })),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({
                "seq": 3,
                "command": "store_client_options",
                "args": { "lazy_load_members": true },
            })
        );

        let request: WorkerRequest = serde_json::from_value(json).unwrap();
        assert_matches!(request.command, WorkerCommand::StoreClientOptions(_));
    }
}
