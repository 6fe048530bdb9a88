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

//! Storage of the media keys of the participants of a call.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Duration,
};

use matrix_client_common::{debug::DebugSecret, sleep::Instant};

use crate::membership::ParticipantId;

/// A media key of a participant.
#[derive(Clone, Eq, PartialEq)]
pub struct KeyRingEntry {
    pub index: u8,
    pub key: Vec<u8>,
    /// When the key was created by its participant, in milliseconds since
    /// the unix epoch.
    pub created_ts: u64,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for KeyRingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRingEntry")
            .field("index", &self.index)
            .field("key", &DebugSecret(&self.key))
            .field("created_ts", &self.created_ts)
            .finish()
    }
}

/// The media keys of every participant, by key index.
///
/// A participant has at most one key per index.
#[derive(Clone, Debug, Default)]
pub struct KeyRing {
    entries: BTreeMap<ParticipantId, Vec<KeyRingEntry>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, unless the participant already has a key for the same
    /// index that isn't older.
    ///
    /// Returns whether the ring changed.
    pub fn insert(&mut self, participant: &ParticipantId, entry: KeyRingEntry) -> bool {
        let keys = self.entries.entry(participant.clone()).or_default();

        match keys.iter_mut().find(|existing| existing.index == entry.index) {
            Some(existing) if existing.created_ts >= entry.created_ts => false,
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                keys.push(entry);
                true
            }
        }
    }

    /// Add a key, replacing any key of the participant for the same index.
    ///
    /// Returns whether the ring changed.
    pub fn replace(&mut self, participant: &ParticipantId, entry: KeyRingEntry) -> bool {
        let keys = self.entries.entry(participant.clone()).or_default();

        match keys.iter_mut().find(|existing| existing.index == entry.index) {
            Some(existing) if *existing == entry => false,
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                keys.push(entry);
                true
            }
        }
    }

    pub fn get(&self, participant: &ParticipantId, index: u8) -> Option<&KeyRingEntry> {
        self.entries.get(participant)?.iter().find(|entry| entry.index == index)
    }

    /// The keys of a participant, in the order they were first added.
    pub fn keys_of(&self, participant: &ParticipantId) -> &[KeyRingEntry] {
        self.entries.get(participant).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn remove_participant(&mut self, participant: &ParticipantId) {
        self.entries.remove(participant);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy of the whole ring.
    pub fn snapshot(&self) -> BTreeMap<ParticipantId, Vec<KeyRingEntry>> {
        self.entries.clone()
    }
}

/// What a [`KeyBuffer`] thinks of a received key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyVerdict {
    /// A newer key for the same index was accepted recently.
    Outdated,
    /// The key is newer than the one accepted recently for the same index.
    Newer,
    /// No key was accepted recently for the same index, so this one wins.
    Unbuffered,
}

/// Filters out keys that were overtaken by a newer key for the same index.
///
/// Keys can reach us through several channels, so a key may arrive after a
/// newer key for the same participant and index. The buffer remembers the
/// timestamp of every accepted key for `ttl`.
#[derive(Debug)]
pub struct KeyBuffer {
    ttl: Duration,
    accepted: HashMap<(ParticipantId, u8), (u64, Instant)>,
}

impl KeyBuffer {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, accepted: HashMap::new() }
    }

    /// Judge a key created at `created_ts`, remembering it unless it is
    /// outdated.
    pub fn check(&mut self, participant: &ParticipantId, index: u8, created_ts: u64) -> KeyVerdict {
        let now = Instant::now();
        let ttl = self.ttl;
        self.accepted.retain(|_, (_, accepted_at)| now.duration_since(*accepted_at) < ttl);

        let slot = (participant.clone(), index);
        let verdict = match self.accepted.get(&slot) {
            Some((last_ts, _)) if created_ts <= *last_ts => return KeyVerdict::Outdated,
            Some(_) => KeyVerdict::Newer,
            None => KeyVerdict::Unbuffered,
        };

        self.accepted.insert(slot, (created_ts, now));
        verdict
    }

    pub fn clear(&mut self) {
        self.accepted.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use matrix_client_common::sleep::sleep;
    use matrix_client_test::{ALICE, ALICE_DEVICE, BOB, BOB_DEVICE};

    use super::{KeyBuffer, KeyRing, KeyRingEntry, KeyVerdict};
    use crate::membership::ParticipantId;

    fn entry(index: u8, key: &[u8], created_ts: u64) -> KeyRingEntry {
        KeyRingEntry { index, key: key.to_vec(), created_ts }
    }

    #[test]
    fn test_older_key_does_not_replace_a_newer_one() {
        let bob = ParticipantId::new(&BOB, &BOB_DEVICE);
        let mut ring = KeyRing::new();

        assert!(ring.insert(&bob, entry(0, b"newer", 2_000)));
        assert!(!ring.insert(&bob, entry(0, b"older", 1_000)));
        assert_eq!(ring.get(&bob, 0).unwrap().key, b"newer");

        assert!(ring.insert(&bob, entry(1, b"other", 500)));
        assert_eq!(ring.keys_of(&bob).len(), 2);

        assert!(ring.replace(&bob, entry(0, b"older", 1_000)));
        assert_eq!(ring.get(&bob, 0).unwrap().key, b"older");
        assert!(!ring.replace(&bob, entry(0, b"older", 1_000)));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let alice = ParticipantId::new(&ALICE, &ALICE_DEVICE);
        let mut ring = KeyRing::new();
        ring.insert(&alice, entry(0, b"key", 1));

        let snapshot = ring.snapshot();
        ring.clear();

        assert!(ring.is_empty());
        assert_eq!(snapshot[&alice], [entry(0, b"key", 1)]);
    }

    #[test]
    fn test_key_debug_hides_the_key() {
        let printed = format!("{:?}", entry(3, b"secret key", 1));
        assert!(printed.contains("<10 secret bytes>"));
        assert!(!printed.contains("secret key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_rejects_outdated_keys_until_the_ttl_elapses() {
        let bob = ParticipantId::new(&BOB, &BOB_DEVICE);
        let mut buffer = KeyBuffer::new(Duration::from_secs(1));

        assert_eq!(buffer.check(&bob, 0, 2_000), KeyVerdict::Unbuffered);
        assert_eq!(buffer.check(&bob, 0, 1_000), KeyVerdict::Outdated);
        assert_eq!(buffer.check(&bob, 0, 2_000), KeyVerdict::Outdated);
        assert_eq!(buffer.check(&bob, 1, 1_000), KeyVerdict::Unbuffered);
        assert_eq!(buffer.check(&bob, 0, 3_000), KeyVerdict::Newer);

        sleep(Duration::from_secs(1)).await;

        assert_eq!(buffer.check(&bob, 0, 1_000), KeyVerdict::Unbuffered);
    }
}
