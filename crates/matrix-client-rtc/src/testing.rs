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

//! A recording [`RtcTransport`] for tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use ruma::{OwnedEventId, OwnedRoomId, RoomId};
use serde_json::Value as JsonValue;
use tokio::sync::watch;

use crate::{
    error::TransportError,
    membership::ParticipantId,
    transport::{RtcTransport, UpdateDelayedEventAction},
};

/// The methods of [`RtcTransport`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransportMethod {
    SendStateEvent,
    SendDelayedStateEvent,
    UpdateDelayedEvent,
    SendToDevice,
    SendEvent,
}

/// A call received by a [`MockTransport`].
#[derive(Clone, Debug, PartialEq)]
pub enum TransportCall {
    SendStateEvent {
        room_id: OwnedRoomId,
        event_type: String,
        state_key: String,
        content: JsonValue,
    },
    SendDelayedStateEvent {
        room_id: OwnedRoomId,
        delay: Duration,
        event_type: String,
        state_key: String,
        content: JsonValue,
    },
    UpdateDelayedEvent {
        delay_id: String,
        action: UpdateDelayedEventAction,
    },
    SendToDevice {
        event_type: String,
        targets: Vec<ParticipantId>,
        content: JsonValue,
    },
    SendEvent {
        room_id: OwnedRoomId,
        event_type: String,
        content: JsonValue,
    },
}

impl TransportCall {
    pub fn method(&self) -> TransportMethod {
        match self {
            Self::SendStateEvent { .. } => TransportMethod::SendStateEvent,
            Self::SendDelayedStateEvent { .. } => TransportMethod::SendDelayedStateEvent,
            Self::UpdateDelayedEvent { .. } => TransportMethod::UpdateDelayedEvent,
            Self::SendToDevice { .. } => TransportMethod::SendToDevice,
            Self::SendEvent { .. } => TransportMethod::SendEvent,
        }
    }

    /// The content sent by this call, if any.
    pub fn content(&self) -> Option<&JsonValue> {
        match self {
            Self::SendStateEvent { content, .. }
            | Self::SendDelayedStateEvent { content, .. }
            | Self::SendToDevice { content, .. }
            | Self::SendEvent { content, .. } => Some(content),
            Self::UpdateDelayedEvent { .. } => None,
        }
    }
}

/// An [`RtcTransport`] recording every call.
///
/// Calls succeed unless an error was queued for their method with
/// [`MockTransport::fail_next`]. Delayed events get the IDs `delay_1`,
/// `delay_2`…
#[derive(Debug)]
pub struct MockTransport {
    calls: watch::Sender<Vec<TransportCall>>,
    failures: Mutex<HashMap<TransportMethod, VecDeque<TransportError>>>,
    next_id: AtomicU64,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (calls, _) = watch::channel(Vec::new());
        Self { calls, failures: Mutex::default(), next_id: AtomicU64::new(1) }
    }

    /// Make the next call to `method` fail with `error`.
    ///
    /// Errors queued for the same method are returned in order.
    pub fn fail_next(&self, method: TransportMethod, error: TransportError) {
        self.failures.lock().unwrap().entry(method).or_default().push_back(error);
    }

    /// Make the next `count` calls to `method` fail with `error`.
    pub fn fail_times(&self, method: TransportMethod, error: TransportError, count: usize) {
        for _ in 0..count {
            self.fail_next(method, error.clone());
        }
    }

    /// All the calls so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.borrow().clone()
    }

    /// The calls to `method` so far.
    pub fn calls_to(&self, method: TransportMethod) -> Vec<TransportCall> {
        self.calls.borrow().iter().filter(|call| call.method() == method).cloned().collect()
    }

    pub fn count(&self, method: TransportMethod) -> usize {
        self.calls.borrow().iter().filter(|call| call.method() == method).count()
    }

    /// Wait until `method` was called at least `count` times.
    pub async fn wait_for_calls(&self, method: TransportMethod, count: usize) {
        let mut receiver = self.calls.subscribe();
        let _ = receiver
            .wait_for(|calls| calls.iter().filter(|call| call.method() == method).count() >= count)
            .await;
    }

    fn record(&self, call: TransportCall) -> Result<u64, TransportError> {
        let method = call.method();
        self.calls.send_modify(|calls| calls.push(call));

        match self.failures.lock().unwrap().get_mut(&method).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(self.next_id.fetch_add(1, Ordering::SeqCst)),
        }
    }
}

#[async_trait]
impl RtcTransport for MockTransport {
    async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<OwnedEventId, TransportError> {
        let id = self.record(TransportCall::SendStateEvent {
            room_id: room_id.to_owned(),
            event_type: event_type.to_owned(),
            state_key: state_key.to_owned(),
            content,
        })?;

        Ok(OwnedEventId::try_from(format!("$mock_state_{id}")).unwrap())
    }

    async fn send_delayed_state_event(
        &self,
        room_id: &RoomId,
        delay: Duration,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<String, TransportError> {
        let id = self.record(TransportCall::SendDelayedStateEvent {
            room_id: room_id.to_owned(),
            delay,
            event_type: event_type.to_owned(),
            state_key: state_key.to_owned(),
            content,
        })?;

        Ok(format!("delay_{id}"))
    }

    async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: UpdateDelayedEventAction,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::UpdateDelayedEvent { delay_id: delay_id.to_owned(), action })?;
        Ok(())
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        targets: &[ParticipantId],
        content: JsonValue,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SendToDevice {
            event_type: event_type.to_owned(),
            targets: targets.to_vec(),
            content,
        })?;
        Ok(())
    }

    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: JsonValue,
    ) -> Result<OwnedEventId, TransportError> {
        let id = self.record(TransportCall::SendEvent {
            room_id: room_id.to_owned(),
            event_type: event_type.to_owned(),
            content,
        })?;

        Ok(OwnedEventId::try_from(format!("$mock_event_{id}")).unwrap())
    }
}
