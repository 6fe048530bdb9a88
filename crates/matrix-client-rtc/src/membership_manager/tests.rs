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

use std::{sync::Arc, time::Duration};

use assert_matches2::{assert_let, assert_matches};
use async_trait::async_trait;
use futures_util::FutureExt;
use matrix_client_common::{sleep::sleep, time::ManualClock};
use matrix_client_test::{
    call_member_event, ALICE, ALICE_DEVICE, BOB, BOB_DEVICE, DEFAULT_TEST_ROOM_ID,
};
use ruma::{OwnedEventId, RoomId};
use serde_json::{json, Value as JsonValue};

use super::{
    membership_state_key, MembershipAction, MembershipConfig, MembershipManager,
    MembershipManagerEvent, MembershipStatus,
};
use crate::{
    error::{MembershipManagerError, TransportError},
    membership::{CallMembership, MembershipSource, ParticipantId},
    session::SessionConfig,
    testing::{MockTransport, TransportCall, TransportMethod},
    transport::{RtcTransport, UpdateDelayedEventAction},
};

fn own_participant() -> ParticipantId {
    ParticipantId::new(&ALICE, &ALICE_DEVICE)
}

fn manager_with_config(config: MembershipConfig) -> (MembershipManager, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let manager = MembershipManager::new(
        &DEFAULT_TEST_ROOM_ID,
        None,
        own_participant(),
        SessionConfig::default(),
        transport.clone(),
        config,
        Arc::new(ManualClock::new(1_000)),
    );

    (manager, transport)
}

fn manager() -> (MembershipManager, Arc<MockTransport>) {
    manager_with_config(MembershipConfig::default())
}

/// A [`MockTransport`] whose updates of delayed events with one action are
/// slow to answer, or never answer when `delay` is `None`.
#[derive(Debug)]
struct SlowTransport {
    inner: Arc<MockTransport>,
    slow_action: UpdateDelayedEventAction,
    delay: Option<Duration>,
}

#[async_trait]
impl RtcTransport for SlowTransport {
    async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<OwnedEventId, TransportError> {
        self.inner.send_state_event(room_id, event_type, state_key, content).await
    }

    async fn send_delayed_state_event(
        &self,
        room_id: &RoomId,
        delay: Duration,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<String, TransportError> {
        self.inner.send_delayed_state_event(room_id, delay, event_type, state_key, content).await
    }

    async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: UpdateDelayedEventAction,
    ) -> Result<(), TransportError> {
        if action == self.slow_action {
            match self.delay {
                Some(delay) => sleep(delay).await,
                None => std::future::pending().await,
            }
        }

        self.inner.update_delayed_event(delay_id, action).await
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        targets: &[ParticipantId],
        content: JsonValue,
    ) -> Result<(), TransportError> {
        self.inner.send_to_device(event_type, targets, content).await
    }

    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: JsonValue,
    ) -> Result<OwnedEventId, TransportError> {
        self.inner.send_event(room_id, event_type, content).await
    }
}

fn slow_manager(
    slow_action: UpdateDelayedEventAction,
    delay: Option<Duration>,
) -> (MembershipManager, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let manager = MembershipManager::new(
        &DEFAULT_TEST_ROOM_ID,
        None,
        own_participant(),
        SessionConfig::default(),
        Arc::new(SlowTransport { inner: transport.clone(), slow_action, delay }),
        MembershipConfig::default(),
        Arc::new(ManualClock::new(1_000)),
    );

    (manager, transport)
}

async fn join_and_wait(manager: &MembershipManager, transport: &MockTransport) {
    manager.join(Vec::new(), None, None);
    transport.wait_for_calls(TransportMethod::SendStateEvent, 1).await;
    assert_eq!(manager.status(), MembershipStatus::Connected);
}

#[test]
fn test_state_key_depends_on_the_room_version() {
    let own = own_participant();

    assert_eq!(membership_state_key(&own, None), "_@alice:server.name_ALICEDEVICE");
    assert_eq!(membership_state_key(&own, Some("11")), "_@alice:server.name_ALICEDEVICE");
    assert_eq!(
        membership_state_key(&own, Some("org.matrix.msc3757.11")),
        "@alice:server.name_ALICEDEVICE"
    );
    assert_eq!(
        membership_state_key(&own, Some("org.matrix.msc3779.10")),
        "@alice:server.name_ALICEDEVICE"
    );
}

#[tokio::test(start_paused = true)]
async fn test_join_schedules_the_lease_then_publishes() {
    let (manager, transport) = manager();
    assert_eq!(manager.status(), MembershipStatus::Disconnected);

    manager.join(Vec::new(), None, Some("audio".to_owned()));
    assert_eq!(manager.status(), MembershipStatus::Connecting);

    transport.wait_for_calls(TransportMethod::SendStateEvent, 1).await;
    assert_eq!(manager.status(), MembershipStatus::Connected);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);

    assert_let!(
        TransportCall::SendDelayedStateEvent { delay, state_key, content, .. } = &calls[0]
    );
    assert_eq!(*delay, Duration::from_secs(8));
    assert_eq!(state_key, "_@alice:server.name_ALICEDEVICE");
    assert_eq!(*content, json!({}));

    assert_let!(TransportCall::SendStateEvent { event_type, content, .. } = &calls[1]);
    assert_eq!(event_type, "org.matrix.msc3401.call.member");
    similar_asserts::assert_eq!(
        *content,
        json!({
            "application": "m.call",
            "call_id": "",
            "scope": "m.room",
            "device_id": "ALICEDEVICE",
            "created_ts": 1_000,
            "expires": 14_400_000,
            "focus_active": { "type": "livekit", "focus_selection": "oldest_membership" },
            "foci_preferred": [],
            "m.call.intent": "audio",
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_joining_twice_publishes_once() {
    let (manager, transport) = manager();

    manager.join(Vec::new(), None, None);
    manager.join(Vec::new(), None, None);
    transport.wait_for_calls(TransportMethod::SendStateEvent, 1).await;

    manager.join(Vec::new(), None, None);
    sleep(Duration::from_secs(1)).await;

    assert_eq!(transport.count(TransportMethod::SendDelayedStateEvent), 1);
    assert_eq!(transport.count(TransportMethod::SendStateEvent), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_lease_is_retried_after_the_given_delay() {
    let (manager, transport) = manager();
    transport.fail_next(
        TransportMethod::SendDelayedStateEvent,
        TransportError::RateLimited { retry_after: Some(Duration::from_secs(1)) },
    );

    manager.join(Vec::new(), None, None);
    transport.wait_for_calls(TransportMethod::SendDelayedStateEvent, 1).await;

    tokio::time::advance(Duration::from_millis(999)).await;
    assert_eq!(transport.count(TransportMethod::SendDelayedStateEvent), 1);

    tokio::time::advance(Duration::from_millis(1)).await;
    transport.wait_for_calls(TransportMethod::SendDelayedStateEvent, 2).await;
    assert_eq!(transport.count(TransportMethod::SendDelayedStateEvent), 2);

    transport.wait_for_calls(TransportMethod::SendStateEvent, 1).await;
    assert_eq!(manager.status(), MembershipStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_missing_own_membership_is_published_again() {
    let (manager, transport) = manager();
    join_and_wait(&manager, &transport).await;

    let mut status = manager.subscribe_status();

    let bob = CallMembership::from_event(
        &call_member_event(&BOB, &BOB_DEVICE),
        MembershipSource::State,
        1_000,
    )
    .unwrap();
    manager.on_rtc_session_member_update(&[bob]);

    transport.wait_for_calls(TransportMethod::SendStateEvent, 2).await;

    assert_eq!(transport.count(TransportMethod::SendDelayedStateEvent), 2);
    assert_eq!(
        transport.calls_to(TransportMethod::UpdateDelayedEvent),
        [TransportCall::UpdateDelayedEvent {
            delay_id: "delay_1".to_owned(),
            action: UpdateDelayedEventAction::Cancel,
        }]
    );

    // The device stayed connected the whole time.
    assert_eq!(manager.status(), MembershipStatus::Connected);
    assert!(status.next().now_or_never().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_present_own_membership_changes_nothing() {
    let (manager, transport) = manager();
    join_and_wait(&manager, &transport).await;

    let own = CallMembership::from_event(
        &call_member_event(&ALICE, &ALICE_DEVICE),
        MembershipSource::State,
        1_000,
    )
    .unwrap();
    manager.on_rtc_session_member_update(&[own]);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.count(TransportMethod::SendStateEvent), 1);
    assert_eq!(transport.count(TransportMethod::SendDelayedStateEvent), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lease_is_restarted_periodically() {
    let (manager, transport) = manager();
    join_and_wait(&manager, &transport).await;

    transport.wait_for_calls(TransportMethod::UpdateDelayedEvent, 3).await;

    for call in transport.calls_to(TransportMethod::UpdateDelayedEvent) {
        assert_eq!(
            call,
            TransportCall::UpdateDelayedEvent {
                delay_id: "delay_1".to_owned(),
                action: UpdateDelayedEventAction::Restart,
            }
        );
    }

    assert!(!manager.probably_left());
}

#[tokio::test(start_paused = true)]
async fn test_lost_lease_publishes_the_membership_again() {
    let (manager, transport) = manager();
    join_and_wait(&manager, &transport).await;

    transport.fail_next(TransportMethod::UpdateDelayedEvent, TransportError::NotFound);

    transport.wait_for_calls(TransportMethod::SendDelayedStateEvent, 2).await;
    transport.wait_for_calls(TransportMethod::SendStateEvent, 2).await;
    assert_eq!(manager.status(), MembershipStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_server_without_delayed_events_relies_on_the_expiry() {
    let config = MembershipConfig::new()
        .membership_expiry(Duration::from_secs(10))
        .expiry_headroom(Duration::from_secs(1));
    let (manager, transport) = manager_with_config(config);
    transport.fail_next(TransportMethod::SendDelayedStateEvent, TransportError::Unsupported);

    join_and_wait(&manager, &transport).await;

    transport.wait_for_calls(TransportMethod::SendStateEvent, 2).await;
    let calls = transport.calls_to(TransportMethod::SendStateEvent);
    assert_eq!(calls[0].content().unwrap()["expires"], 10_000);
    assert_eq!(calls[1].content().unwrap()["expires"], 20_000);
    assert_eq!(calls[1].content().unwrap()["created_ts"], 1_000);

    assert_eq!(transport.count(TransportMethod::SendDelayedStateEvent), 1);
    assert_eq!(transport.count(TransportMethod::UpdateDelayedEvent), 0);

    // Without a lease, leaving publishes an empty membership.
    assert!(manager.leave(None).await);
    let calls = transport.calls_to(TransportMethod::SendStateEvent);
    assert_eq!(*calls.last().unwrap().content().unwrap(), json!({}));
    assert_eq!(manager.status(), MembershipStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_too_long_lease_is_clamped() {
    let (manager, transport) = manager();
    transport.fail_next(
        TransportMethod::SendDelayedStateEvent,
        TransportError::MaxDelayExceeded { max_delay: Duration::from_secs(4) },
    );

    join_and_wait(&manager, &transport).await;

    let calls = transport.calls_to(TransportMethod::SendDelayedStateEvent);
    assert_eq!(calls.len(), 2);
    assert_let!(TransportCall::SendDelayedStateEvent { delay, .. } = &calls[1]);
    assert_eq!(*delay, Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_missed_lease_restarts_flag_the_device_as_probably_left() {
    let (manager, transport) = manager();
    let mut events = manager.subscribe_events();
    join_and_wait(&manager, &transport).await;

    transport.fail_times(
        TransportMethod::UpdateDelayedEvent,
        TransportError::Network("offline".to_owned()),
        2,
    );

    assert_eq!(events.recv().await.unwrap(), MembershipManagerEvent::ProbablyLeft(true));
    assert!(manager.probably_left());

    assert_eq!(events.recv().await.unwrap(), MembershipManagerEvent::ProbablyLeft(false));
    assert!(!manager.probably_left());
    assert_eq!(manager.status(), MembershipStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_disconnect() {
    let config = MembershipConfig::new().maximum_rate_limit_retry_count(2);
    let (manager, transport) = manager_with_config(config);
    let mut events = manager.subscribe_events();

    transport.fail_times(
        TransportMethod::SendDelayedStateEvent,
        TransportError::RateLimited { retry_after: None },
        3,
    );

    manager.join(Vec::new(), None, None);

    assert_let!(Ok(MembershipManagerEvent::Error(error)) = events.recv().await);
    assert_eq!(
        error,
        MembershipManagerError::RateLimitRetriesExhausted {
            action: MembershipAction::SendDelayedLeave,
            retries: 2,
        }
    );
    assert_eq!(manager.status(), MembershipStatus::Disconnected);
    assert_eq!(transport.count(TransportMethod::SendDelayedStateEvent), 3);
    assert_eq!(transport.count(TransportMethod::SendStateEvent), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unrecoverable_error_disconnects_right_away() {
    let (manager, transport) = manager();
    let mut events = manager.subscribe_events();

    transport.fail_next(
        TransportMethod::SendStateEvent,
        TransportError::Http { status: 403, message: "forbidden".to_owned() },
    );

    manager.join(Vec::new(), None, None);

    assert_let!(Ok(MembershipManagerEvent::Error(error)) = events.recv().await);
    assert_matches!(
        error,
        MembershipManagerError::Unrecoverable { action: MembershipAction::SendJoin, .. }
    );
    assert_eq!(manager.status(), MembershipStatus::Disconnected);
    assert_eq!(transport.count(TransportMethod::SendStateEvent), 1);
}

#[tokio::test(start_paused = true)]
async fn test_leave_sends_the_lease() {
    let (manager, transport) = manager();
    join_and_wait(&manager, &transport).await;

    assert!(manager.leave(None).await);
    assert_eq!(manager.status(), MembershipStatus::Disconnected);

    let updates = transport.calls_to(TransportMethod::UpdateDelayedEvent);
    assert_eq!(
        updates.last(),
        Some(&TransportCall::UpdateDelayedEvent {
            delay_id: "delay_1".to_owned(),
            action: UpdateDelayedEventAction::Send,
        })
    );
    assert_eq!(transport.count(TransportMethod::SendStateEvent), 1);

    // Leaving again is a no-op.
    assert!(manager.leave(Some(Duration::from_secs(1))).await);
}

#[tokio::test(start_paused = true)]
async fn test_leave_falls_back_to_an_empty_membership() {
    let (manager, transport) = manager();
    join_and_wait(&manager, &transport).await;

    transport.fail_next(
        TransportMethod::UpdateDelayedEvent,
        TransportError::Http { status: 400, message: "bad request".to_owned() },
    );

    assert!(manager.leave(None).await);

    let calls = transport.calls_to(TransportMethod::SendStateEvent);
    assert_eq!(calls.len(), 2);
    assert_eq!(*calls[1].content().unwrap(), json!({}));
    assert_eq!(manager.status(), MembershipStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_pending_retry_does_not_run_after_leaving() {
    let (manager, transport) = manager();
    transport.fail_next(TransportMethod::SendStateEvent, TransportError::Network("offline".to_owned()));

    manager.join(Vec::new(), None, None);
    transport.wait_for_calls(TransportMethod::SendStateEvent, 1).await;
    assert_eq!(manager.status(), MembershipStatus::Connecting);

    assert!(manager.leave(None).await);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.count(TransportMethod::SendStateEvent), 1);
    assert_eq!(manager.status(), MembershipStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_leave_times_out() {
    let (manager, transport) = manager();
    join_and_wait(&manager, &transport).await;

    transport.fail_times(
        TransportMethod::UpdateDelayedEvent,
        TransportError::Network("offline".to_owned()),
        5,
    );

    assert!(!manager.leave(Some(Duration::from_secs(1))).await);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_lease_restart_flags_the_device_and_leave_proceeds() {
    let (manager, transport) = slow_manager(UpdateDelayedEventAction::Restart, None);
    let mut events = manager.subscribe_events();
    join_and_wait(&manager, &transport).await;

    // The first restart never gets an answer, the lease runs out meanwhile.
    assert_eq!(events.recv().await.unwrap(), MembershipManagerEvent::ProbablyLeft(true));
    assert!(manager.probably_left());
    assert_eq!(manager.status(), MembershipStatus::Connected);

    assert!(manager.leave(Some(Duration::from_secs(1))).await);
    assert_eq!(manager.status(), MembershipStatus::Disconnected);
    assert!(!manager.probably_left());

    assert_eq!(
        transport.calls_to(TransportMethod::UpdateDelayedEvent),
        [TransportCall::UpdateDelayedEvent {
            delay_id: "delay_1".to_owned(),
            action: UpdateDelayedEventAction::Send,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_join_while_leaving_waits_for_the_leave() {
    let (manager, transport) =
        slow_manager(UpdateDelayedEventAction::Send, Some(Duration::from_secs(1)));
    join_and_wait(&manager, &transport).await;

    let (left, ()) = tokio::join!(manager.leave(None), async {
        sleep(Duration::from_millis(100)).await;
        manager.join(Vec::new(), None, None);
    });
    assert!(left);

    transport.wait_for_calls(TransportMethod::SendStateEvent, 2).await;
    assert_eq!(manager.status(), MembershipStatus::Connected);

    let calls = transport.calls();
    assert_eq!(
        calls.iter().map(TransportCall::method).collect::<Vec<_>>(),
        [
            TransportMethod::SendDelayedStateEvent,
            TransportMethod::SendStateEvent,
            TransportMethod::UpdateDelayedEvent,
            TransportMethod::SendDelayedStateEvent,
            TransportMethod::SendStateEvent,
        ]
    );

    // The lease of the first membership was sent before the second one.
    assert_eq!(
        calls[2],
        TransportCall::UpdateDelayedEvent {
            delay_id: "delay_1".to_owned(),
            action: UpdateDelayedEventAction::Send,
        }
    );
}
