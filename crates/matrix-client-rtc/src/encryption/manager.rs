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
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use eyeball::SharedObservable;
use matrix_client_common::{
    executor::{spawn, AbortOnDrop, JoinHandleExt},
    sleep::{sleep_until, Instant},
    time::Clock,
};
use rand::{thread_rng, RngCore};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
    CallEncryption, EncryptionConfig, EncryptionKeyChanged, KeyBuffer, KeyRing, KeyRingEntry,
    KeyTransport, KeyVerdict, OutboundKey, ReceivedKey,
};
use crate::membership::{CallMembership, ParticipantId};

const KEY_LENGTH: usize = 16;

/// How the participants of the call get a key when they change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Strategy {
    /// Every change creates a new key, sent to everybody.
    Basic,
    /// Only leaving participants create a new key, joining ones get the
    /// current key.
    Differential,
}

enum Command {
    Join,
    Leave,
    Memberships(Vec<CallMembership>),
}

fn lock(key_ring: &Mutex<KeyRing>) -> MutexGuard<'_, KeyRing> {
    key_ring.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
    key_ring: Arc<Mutex<KeyRing>>,
    own_key_index: SharedObservable<Option<u8>>,
    events: broadcast::Sender<EncryptionKeyChanged>,
    _task: AbortOnDrop<()>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("own_key_index", &self.own_key_index.get())
            .finish_non_exhaustive()
    }
}

impl ManagerHandle {
    fn new(
        strategy: Strategy,
        own: ParticipantId,
        transport: Arc<dyn KeyTransport>,
        config: EncryptionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let key_ring = Arc::new(Mutex::new(KeyRing::new()));
        let own_key_index = SharedObservable::new(None);
        let (events, _) = broadcast::channel(16);
        let (commands, receiver) = mpsc::unbounded_channel();
        let received_keys = transport.subscribe();

        let actor = Actor {
            strategy,
            own,
            config,
            transport,
            clock,
            key_ring: key_ring.clone(),
            own_key_index: own_key_index.clone(),
            events: events.clone(),
            buffer: KeyBuffer::new(config.key_buffer_ttl),
            joined: false,
            current_key: None,
            members: BTreeMap::new(),
            pending_memberships: None,
            debounce_deadline: None,
            rollouts: VecDeque::new(),
        };

        let task = spawn(actor.run(receiver, received_keys)).abort_on_drop();

        Self { commands, key_ring, own_key_index, events, _task: task }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("The encryption manager task is gone");
        }
    }

    fn join(&self) {
        self.send(Command::Join);
    }

    fn leave(&self) {
        self.send(Command::Leave);
    }

    fn on_memberships_changed(&self, memberships: &[CallMembership]) {
        self.send(Command::Memberships(memberships.to_vec()));
    }

    fn subscribe(&self) -> broadcast::Receiver<EncryptionKeyChanged> {
        self.events.subscribe()
    }

    fn key_ring_snapshot(&self) -> BTreeMap<ParticipantId, Vec<KeyRingEntry>> {
        lock(&self.key_ring).snapshot()
    }

    fn own_key_index(&self) -> Option<u8> {
        self.own_key_index.get()
    }
}

macro_rules! impl_call_encryption {
    ($name:ident) => {
        impl CallEncryption for $name {
            fn join(&self) {
                self.inner.join();
            }

            fn leave(&self) {
                self.inner.leave();
            }

            fn on_memberships_changed(&self, memberships: &[CallMembership]) {
                self.inner.on_memberships_changed(memberships);
            }

            fn subscribe(&self) -> broadcast::Receiver<EncryptionKeyChanged> {
                self.inner.subscribe()
            }

            fn key_ring_snapshot(&self) -> BTreeMap<ParticipantId, Vec<KeyRingEntry>> {
                self.inner.key_ring_snapshot()
            }

            fn own_key_index(&self) -> Option<u8> {
                self.inner.own_key_index()
            }
        }
    };
}

/// Creates a new key every time the participants of the call change, and
/// sends it to all of them.
#[derive(Debug)]
pub struct EncryptionManager {
    inner: ManagerHandle,
}

impl EncryptionManager {
    pub fn new(
        own: ParticipantId,
        transport: Arc<dyn KeyTransport>,
        config: EncryptionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { inner: ManagerHandle::new(Strategy::Basic, own, transport, config, clock) }
    }
}

impl_call_encryption!(EncryptionManager);

/// Creates a new key only when participants leave the call.
///
/// Joining participants get the current key, which spares the others a key
/// switch. A participant whose membership was created again is sent the
/// current key too.
#[derive(Debug)]
pub struct RtcEncryptionManager {
    inner: ManagerHandle,
}

impl RtcEncryptionManager {
    pub fn new(
        own: ParticipantId,
        transport: Arc<dyn KeyTransport>,
        config: EncryptionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { inner: ManagerHandle::new(Strategy::Differential, own, transport, config, clock) }
    }
}

impl_call_encryption!(RtcEncryptionManager);

struct Actor {
    strategy: Strategy,
    own: ParticipantId,
    config: EncryptionConfig,
    transport: Arc<dyn KeyTransport>,
    clock: Arc<dyn Clock>,
    key_ring: Arc<Mutex<KeyRing>>,
    own_key_index: SharedObservable<Option<u8>>,
    events: broadcast::Sender<EncryptionKeyChanged>,

    buffer: KeyBuffer,
    joined: bool,
    current_key: Option<OutboundKey>,
    /// The other participants the current key was sent to, with the
    /// creation timestamp of their membership.
    members: BTreeMap<ParticipantId, u64>,
    pending_memberships: Option<Vec<CallMembership>>,
    debounce_deadline: Option<Instant>,
    /// Keys waiting to be used locally, oldest first.
    rollouts: VecDeque<(Instant, OutboundKey)>,
}

impl Actor {
    #[instrument(skip_all, fields(own = %self.own, strategy = ?self.strategy))]
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut received_keys: broadcast::Receiver<ReceivedKey>,
    ) {
        let mut receiving_keys = true;

        loop {
            let rollout = self.rollouts.front().map(|(at, _)| *at);
            let debounce = self.debounce_deadline;

            tokio::select! {
                biased;

                _ = sleep_until(rollout.unwrap_or_else(Instant::now)), if rollout.is_some() => {
                    self.roll_out_due_keys();
                }

                _ = sleep_until(debounce.unwrap_or_else(Instant::now)), if debounce.is_some() => {
                    self.apply_memberships().await;
                }

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                key = received_keys.recv(), if receiving_keys => match key {
                    Ok(key) => self.on_received_key(key),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed some received keys");
                    }
                    Err(RecvError::Closed) => receiving_keys = false,
                },
            }
        }

        trace!("The encryption manager was dropped, stopping its task");
    }

    fn handle_command(&mut self, command: Command) {
        if !self.config.manage_media_keys {
            return;
        }

        match command {
            Command::Join => self.on_join(),
            Command::Leave => self.on_leave(),
            Command::Memberships(memberships) => {
                if !self.joined {
                    return;
                }

                self.pending_memberships = Some(memberships);
                if self.debounce_deadline.is_none() {
                    self.debounce_deadline = Some(Instant::now() + self.config.debounce);
                }
            }
        }
    }

    fn new_key(&self, index: u8) -> OutboundKey {
        let mut key = vec![0; KEY_LENGTH];
        thread_rng().fill_bytes(&mut key);

        OutboundKey { index, key, created_ts: self.clock.now_millis() }
    }

    fn set_current_key(&mut self, key: &OutboundKey) {
        let entry =
            KeyRingEntry { index: key.index, key: key.key.clone(), created_ts: key.created_ts };
        lock(&self.key_ring).replace(&self.own, entry);
        self.current_key = Some(key.clone());
        self.transport.set_current_key(Some(key));
    }

    fn on_join(&mut self) {
        if self.joined {
            return;
        }

        info!("Creating the first media key");

        self.joined = true;

        // Nobody else is there yet, the key is used right away.
        let key = self.new_key(0);
        self.set_current_key(&key);
        self.roll_out(key);
    }

    fn on_leave(&mut self) {
        if !self.joined {
            return;
        }

        info!("Forgetting every media key");

        self.joined = false;
        self.current_key = None;
        self.transport.set_current_key(None);
        self.members.clear();
        self.pending_memberships = None;
        self.debounce_deadline = None;
        self.rollouts.clear();
        self.buffer.clear();
        lock(&self.key_ring).clear();
        self.own_key_index.set(None);
    }

    fn roll_out(&self, key: OutboundKey) {
        debug!(index = key.index, "Using a new media key");

        self.own_key_index.set(Some(key.index));
        let _ = self.events.send(EncryptionKeyChanged {
            key: key.key,
            index: key.index,
            participant: self.own.clone(),
        });
    }

    fn roll_out_due_keys(&mut self) {
        let now = Instant::now();

        while self.rollouts.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, key)) = self.rollouts.pop_front() {
                self.roll_out(key);
            }
        }
    }

    async fn apply_memberships(&mut self) {
        self.debounce_deadline = None;

        let Some(memberships) = self.pending_memberships.take() else {
            return;
        };
        if !self.joined {
            return;
        }

        let members: BTreeMap<ParticipantId, u64> = memberships
            .iter()
            .map(|membership| (membership.participant(), membership.created_ts()))
            .filter(|(participant, _)| *participant != self.own)
            .collect();
        let previous = std::mem::replace(&mut self.members, members);

        match self.strategy {
            Strategy::Basic => {
                if previous != self.members {
                    self.rotate_and_distribute().await;
                }
            }
            Strategy::Differential => {
                let someone_left =
                    previous.keys().any(|participant| !self.members.contains_key(participant));

                if someone_left {
                    self.rotate_and_distribute().await;
                } else {
                    let newcomers: Vec<_> = self
                        .members
                        .iter()
                        .filter(|(participant, created_ts)| {
                            previous.get(*participant) != Some(*created_ts)
                        })
                        .map(|(participant, _)| participant.clone())
                        .collect();

                    if let Some(key) = self.current_key.clone() {
                        debug!(count = newcomers.len(), "Sending the current key to new members");
                        self.distribute(&key, &newcomers).await;
                    }
                }
            }
        }
    }

    async fn rotate_and_distribute(&mut self) {
        let index = self.current_key.as_ref().map_or(0, |key| key.index.wrapping_add(1));
        let key = self.new_key(index);

        debug!(index, "Rotating the media key");

        self.set_current_key(&key);

        let targets: Vec<_> = self.members.keys().cloned().collect();
        self.distribute(&key, &targets).await;

        self.rollouts.push_back((Instant::now() + self.config.rollout_delay, key));
    }

    async fn distribute(&self, key: &OutboundKey, targets: &[ParticipantId]) {
        if targets.is_empty() {
            return;
        }

        if let Err(error) = self.transport.send_key(key, targets).await {
            warn!(%error, index = key.index, "Failed to send the media key");
        }
    }

    fn on_received_key(&mut self, received: ReceivedKey) {
        if !self.config.manage_media_keys || received.participant == self.own {
            return;
        }

        let entry = KeyRingEntry {
            index: received.index,
            key: received.key.clone(),
            created_ts: received.sent_ts,
        };

        let changed = match self.buffer.check(&received.participant, received.index, received.sent_ts)
        {
            KeyVerdict::Outdated => {
                debug!(
                    participant = %received.participant,
                    index = received.index,
                    "Ignoring an outdated key"
                );
                false
            }
            KeyVerdict::Newer => lock(&self.key_ring).insert(&received.participant, entry),
            KeyVerdict::Unbuffered => lock(&self.key_ring).replace(&received.participant, entry),
        };

        if changed {
            trace!(participant = %received.participant, index = received.index, "Received a key");

            let _ = self.events.send(EncryptionKeyChanged {
                key: received.key,
                index: received.index,
                participant: received.participant,
            });
        }
    }
}
