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

//! Keeping the local device in a call.
//!
//! The [`MembershipManager`] publishes the `m.call.member` state event of the
//! local device and makes sure it disappears when the device goes away. For
//! the latter it schedules a delayed leave event on the server (the lease),
//! which the server sends unless the manager keeps restarting it. Servers
//! without delayed events get a membership with a bounded expiry instead,
//! extended periodically.
//!
//! All the work happens in a single task per manager. Commands, timers and
//! responses are handled one at a time, while at most one request waits for
//! the server.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use eyeball::{SharedObservable, Subscriber};
use futures_util::future::BoxFuture;
use matrix_client_common::{
    executor::{spawn, AbortOnDrop, JoinHandleExt},
    sleep::{sleep_until, timeout, Instant},
    time::Clock,
};
use ruma::{OwnedRoomId, RoomId};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    error::{MembershipManagerError, TransportError},
    membership::{ActiveFocus, CallMembership, Focus, ParticipantId},
    session::SessionConfig,
    transport::{RtcTransport, UpdateDelayedEventAction, CALL_MEMBER_EVENT_TYPE},
};

mod config;
#[cfg(test)]
mod tests;

pub use self::config::MembershipConfig;

/// Where the local device stands in the call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MembershipStatus {
    Disconnected,
    /// [`MembershipManager::join`] was called, the membership isn't
    /// published yet.
    Connecting,
    /// The membership is published.
    Connected,
    Disconnecting,
}

/// The units of work of a [`MembershipManager`].
///
/// Retries are counted per action.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MembershipAction {
    /// Schedule the delayed leave event.
    SendDelayedLeave,
    /// Publish the membership.
    SendJoin,
    /// Restart the timeout of the delayed leave event.
    RestartDelayedLeave,
    /// Publish the membership again with a later expiry.
    UpdateExpiry,
    /// Ask the server to send the delayed leave event right away.
    SendScheduledDelayedLeave,
    /// Publish an empty membership.
    SendLeave,
    /// The lease wasn't restarted for as long as it lasts.
    ProbablyLeftTimeout,
}

impl MembershipAction {
    fn is_leave(self) -> bool {
        matches!(self, Self::SendScheduledDelayedLeave | Self::SendLeave)
    }

    /// Requests keeping a published membership alive.
    fn is_heartbeat(self) -> bool {
        matches!(self, Self::RestartDelayedLeave | Self::UpdateExpiry)
    }

    /// Actions that don't talk to the server.
    fn is_local(self) -> bool {
        matches!(self, Self::ProbablyLeftTimeout)
    }
}

/// Notifications sent by a [`MembershipManager`].
#[derive(Clone, Debug, PartialEq)]
pub enum MembershipManagerEvent {
    /// Whether the server probably considers the device gone, because the
    /// lease couldn't be restarted in time.
    ProbablyLeft(bool),
    /// The manager gave up and disconnected.
    Error(MembershipManagerError),
}

/// Whether the server supports delayed events.
///
/// This is found out the first time a delayed event is scheduled, and never
/// changes afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DelayedEventsSupport {
    Unknown,
    Supported,
    Unsupported,
}

/// What the local device announces in its membership.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JoinParameters {
    pub foci_preferred: Vec<Focus>,
    pub focus_active: Option<ActiveFocus>,
    pub intent: Option<String>,
}

/// The state key of the membership of a device.
///
/// Rooms whose version lets users own state keys starting with their user
/// ID use `{user_id}_{device_id}`, the others need a leading underscore.
pub fn membership_state_key(participant: &ParticipantId, room_version: Option<&str>) -> String {
    let user_owned_state_keys = room_version.is_some_and(|version| {
        version.starts_with("org.matrix.msc3757.") || version.starts_with("org.matrix.msc3779.")
    });

    if user_owned_state_keys {
        format!("{}_{}", participant.user_id, participant.device_id)
    } else {
        format!("_{}_{}", participant.user_id, participant.device_id)
    }
}

enum Command {
    Join(JoinParameters),
    Leave(oneshot::Sender<()>),
    MemberUpdate(Vec<CallMembership>),
}

/// Publishes and maintains the membership of the local device in a call.
pub struct MembershipManager {
    room_id: OwnedRoomId,
    state_key: String,
    status: SharedObservable<MembershipStatus>,
    probably_left: SharedObservable<bool>,
    events: broadcast::Sender<MembershipManagerEvent>,
    commands: mpsc::UnboundedSender<Command>,
    _task: AbortOnDrop<()>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for MembershipManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipManager")
            .field("room_id", &self.room_id)
            .field("state_key", &self.state_key)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl MembershipManager {
    /// Create the manager of the local device `own` in the call `session` of
    /// a room.
    ///
    /// The state key of the membership depends on `room_version` and is
    /// fixed for the lifetime of the manager. This spawns the task of the
    /// manager, which is aborted when the manager is dropped.
    pub fn new(
        room_id: &RoomId,
        room_version: Option<&str>,
        own: ParticipantId,
        session: SessionConfig,
        transport: Arc<dyn RtcTransport>,
        config: MembershipConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state_key = membership_state_key(&own, room_version);
        let status = SharedObservable::new(MembershipStatus::Disconnected);
        let probably_left = SharedObservable::new(false);
        let (events, _) = broadcast::channel(16);
        let (commands, receiver) = mpsc::unbounded_channel();

        let actor = Actor {
            room_id: room_id.to_owned(),
            state_key: state_key.clone(),
            own,
            session,
            transport,
            config,
            clock,
            status: status.clone(),
            probably_left: probably_left.clone(),
            events: events.clone(),
            phase: Phase::Idle,
            generation: 0,
            join_parameters: JoinParameters::default(),
            pending_join: None,
            delayed_events: DelayedEventsSupport::Unknown,
            delayed_leave_delay: config.delayed_leave_delay,
            max_delay_clamped: false,
            delay_id: None,
            lease_to_cancel: None,
            membership_published: false,
            created_ts: None,
            published_at: None,
            expiry_iterations: 0,
            retries: HashMap::new(),
            scheduled: Vec::new(),
            in_flight: None,
            leave_waiters: Vec::new(),
        };

        let task = spawn(actor.run(receiver)).abort_on_drop();

        Self {
            room_id: room_id.to_owned(),
            state_key,
            status,
            probably_left,
            events,
            commands,
            _task: task,
        }
    }

    /// Join the call.
    ///
    /// The status switches to [`MembershipStatus::Connecting`] right away,
    /// and to [`MembershipStatus::Connected`] once the membership is
    /// published. Joining again while connecting or connected does nothing.
    pub fn join(
        &self,
        foci_preferred: Vec<Focus>,
        focus_active: Option<ActiveFocus>,
        intent: Option<String>,
    ) {
        if self.is_joined() {
            debug!(room_id = %self.room_id, "Already joined the call");
            return;
        }

        self.status.set(MembershipStatus::Connecting);

        let parameters = JoinParameters { foci_preferred, focus_active, intent };
        if self.commands.send(Command::Join(parameters)).is_err() {
            error!("The membership manager task is gone");
        }
    }

    /// Leave the call.
    ///
    /// Every scheduled action is cancelled. Returns `true` once the
    /// membership is removed, and `false` if that didn't happen within
    /// `timeout`.
    pub async fn leave(&self, timeout_duration: Option<Duration>) -> bool {
        let (sender, receiver) = oneshot::channel();

        // Set before the actor sees the command, it sets `Disconnected` last.
        if self.is_joined() {
            self.status.set(MembershipStatus::Disconnecting);
        }

        if self.commands.send(Command::Leave(sender)).is_err() {
            return false;
        }

        match timeout_duration {
            Some(duration) => matches!(timeout(duration, receiver).await, Some(Ok(()))),
            None => receiver.await.is_ok(),
        }
    }

    /// Give the manager the latest memberships of the call.
    ///
    /// If the membership of the local device is missing while connected, it
    /// is published again.
    pub fn on_rtc_session_member_update(&self, memberships: &[CallMembership]) {
        if self.commands.send(Command::MemberUpdate(memberships.to_vec())).is_err() {
            error!("The membership manager task is gone");
        }
    }

    pub fn status(&self) -> MembershipStatus {
        self.status.get()
    }

    pub fn subscribe_status(&self) -> Subscriber<MembershipStatus> {
        self.status.subscribe()
    }

    /// Whether [`join`](Self::join) was called and the manager didn't leave
    /// since.
    pub fn is_joined(&self) -> bool {
        matches!(self.status.get(), MembershipStatus::Connecting | MembershipStatus::Connected)
    }

    pub fn probably_left(&self) -> bool {
        self.probably_left.get()
    }

    pub fn subscribe_probably_left(&self) -> Subscriber<bool> {
        self.probably_left.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MembershipManagerEvent> {
        self.events.subscribe()
    }

    /// The state key of the membership of the local device.
    pub fn state_key(&self) -> &str {
        &self.state_key
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    Joined,
    Leaving,
}

#[derive(Debug, Default)]
struct RetryCounters {
    rate_limited: u32,
    network: u32,
}

#[derive(Debug)]
struct ScheduledAction {
    at: Instant,
    action: MembershipAction,
    /// Actions of a previous activation never run.
    generation: u64,
}

/// The answer to a request, with the ID of the delayed event for requests
/// scheduling one.
type Response = Result<Option<String>, TransportError>;

/// The request of an action, waiting for the server.
struct InFlight {
    action: MembershipAction,
    generation: u64,
    response: BoxFuture<'static, Response>,
}

async fn wait_for_response(in_flight: &mut Option<InFlight>) -> Response {
    match in_flight {
        Some(in_flight) => (&mut in_flight.response).await,
        None => std::future::pending().await,
    }
}

struct Actor {
    room_id: OwnedRoomId,
    state_key: String,
    own: ParticipantId,
    session: SessionConfig,
    transport: Arc<dyn RtcTransport>,
    config: MembershipConfig,
    clock: Arc<dyn Clock>,
    status: SharedObservable<MembershipStatus>,
    probably_left: SharedObservable<bool>,
    events: broadcast::Sender<MembershipManagerEvent>,

    phase: Phase,
    generation: u64,
    join_parameters: JoinParameters,
    /// A join received while leaving, started once the leave completes.
    pending_join: Option<JoinParameters>,
    delayed_events: DelayedEventsSupport,
    delayed_leave_delay: Duration,
    max_delay_clamped: bool,
    delay_id: Option<String>,
    /// A lease replaced by a new one, cancelled before the new one is
    /// scheduled.
    lease_to_cancel: Option<String>,
    membership_published: bool,
    created_ts: Option<u64>,
    published_at: Option<Instant>,
    expiry_iterations: u32,
    retries: HashMap<MembershipAction, RetryCounters>,
    scheduled: Vec<ScheduledAction>,
    in_flight: Option<InFlight>,
    leave_waiters: Vec<oneshot::Sender<()>>,
}

impl Actor {
    /// Handle commands, timers and responses one at a time.
    ///
    /// At most one request is in flight. While it is, only the local
    /// [`MembershipAction::ProbablyLeftTimeout`] may fire, other actions wait
    /// for the response.
    #[instrument(skip_all, fields(room_id = %self.room_id, state_key = %self.state_key))]
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        trace!("Spawned the membership manager task");

        loop {
            let busy = self.in_flight.is_some();
            let next_deadline = self
                .scheduled
                .iter()
                .filter(|scheduled| !busy || scheduled.action.is_local())
                .map(|scheduled| scheduled.at)
                .min();

            tokio::select! {
                biased;

                response = wait_for_response(&mut self.in_flight), if busy => {
                    if let Some(in_flight) = self.in_flight.take() {
                        self.on_response(in_flight.action, in_flight.generation, response);
                    }
                }

                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    if let Some(scheduled) = self.pop_due(busy) {
                        if scheduled.generation == self.generation {
                            self.start_action(scheduled.action);
                        } else {
                            trace!(action = ?scheduled.action, "Dropping a stale action");
                        }
                    }
                }

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        trace!("The membership manager was dropped, stopping its task");
    }

    fn pop_due(&mut self, busy: bool) -> Option<ScheduledAction> {
        let now = Instant::now();
        let (index, _) = self
            .scheduled
            .iter()
            .enumerate()
            .filter(|(_, scheduled)| {
                scheduled.at <= now && (!busy || scheduled.action.is_local())
            })
            .min_by_key(|(index, scheduled)| (scheduled.at, *index))?;

        Some(self.scheduled.remove(index))
    }

    fn schedule_at(&mut self, action: MembershipAction, at: Instant) {
        self.unschedule(action);
        self.scheduled.push(ScheduledAction { at, action, generation: self.generation });
    }

    fn schedule(&mut self, action: MembershipAction, delay: Duration) {
        self.schedule_at(action, Instant::now() + delay);
    }

    fn schedule_now(&mut self, action: MembershipAction) {
        self.schedule(action, Duration::ZERO);
    }

    fn unschedule(&mut self, action: MembershipAction) {
        self.scheduled.retain(|scheduled| scheduled.action != action);
    }

    /// The action that publishes the membership from scratch.
    fn first_action(&self) -> MembershipAction {
        if self.delayed_events == DelayedEventsSupport::Unsupported {
            MembershipAction::SendJoin
        } else {
            MembershipAction::SendDelayedLeave
        }
    }

    fn is_heartbeat_in_flight(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|in_flight| in_flight.action.is_heartbeat())
    }

    fn set_status(&self, status: MembershipStatus) {
        if let Some(previous) = self.status.set_if_not_eq(status) {
            debug!(?previous, ?status, "Membership status changed");
        }
    }

    fn set_probably_left(&self, probably_left: bool) {
        if self.probably_left.set_if_not_eq(probably_left).is_some() {
            info!(probably_left, "The server may consider the device gone");
            let _ = self.events.send(MembershipManagerEvent::ProbablyLeft(probably_left));
        }
    }

    fn arm_probably_left(&mut self) {
        self.schedule(MembershipAction::ProbablyLeftTimeout, self.delayed_leave_delay);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join(parameters) => self.on_join(parameters),
            Command::Leave(responder) => self.on_leave(responder),
            Command::MemberUpdate(memberships) => self.on_member_update(&memberships),
        }
    }

    fn on_join(&mut self, parameters: JoinParameters) {
        match self.phase {
            Phase::Joined => {
                debug!("Ignoring a join, the manager is already active");
                self.set_status(if self.membership_published {
                    MembershipStatus::Connected
                } else {
                    MembershipStatus::Connecting
                });
                return;
            }
            Phase::Leaving => {
                debug!("Joining again once the previous leave completed");
                self.pending_join = Some(parameters);
                self.set_status(MembershipStatus::Disconnecting);
                return;
            }
            Phase::Idle => {}
        }

        info!("Joining the call");

        self.phase = Phase::Joined;
        self.generation += 1;
        self.scheduled.clear();
        self.retries.clear();
        self.join_parameters = parameters;
        self.delayed_leave_delay = self.config.delayed_leave_delay;
        self.max_delay_clamped = false;
        self.membership_published = false;
        self.created_ts = None;
        self.expiry_iterations = 0;

        self.set_status(MembershipStatus::Connecting);
        self.schedule_now(self.first_action());
    }

    fn on_leave(&mut self, responder: oneshot::Sender<()>) {
        match self.phase {
            Phase::Idle => {
                self.set_status(MembershipStatus::Disconnected);
                let _ = responder.send(());
                return;
            }
            Phase::Leaving => {
                self.pending_join = None;
                self.set_status(MembershipStatus::Disconnecting);
                self.leave_waiters.push(responder);
                return;
            }
            Phase::Joined => {}
        }

        info!("Leaving the call");

        self.phase = Phase::Leaving;
        self.generation += 1;
        self.scheduled.clear();
        self.retries.clear();
        self.leave_waiters.push(responder);
        self.set_status(MembershipStatus::Disconnecting);

        if self.is_heartbeat_in_flight() {
            debug!("Dropping the pending heartbeat");
            self.in_flight = None;
        }

        if self.delay_id.is_none() {
            self.delay_id = self.lease_to_cancel.take();
        }

        if self.in_flight.is_none() && self.delay_id.is_none() && !self.membership_published {
            self.finish_leave();
        } else {
            // Waits for a publication in flight, so its lease is known.
            self.schedule_now(MembershipAction::SendScheduledDelayedLeave);
        }
    }

    fn finish_leave(&mut self) {
        self.phase = Phase::Idle;
        self.scheduled.clear();
        self.delay_id = None;
        self.lease_to_cancel = None;
        self.membership_published = false;
        self.created_ts = None;
        self.published_at = None;

        self.set_probably_left(false);
        self.set_status(MembershipStatus::Disconnected);

        for waiter in self.leave_waiters.drain(..) {
            let _ = waiter.send(());
        }

        if let Some(parameters) = self.pending_join.take() {
            self.on_join(parameters);
        }
    }

    fn is_own_membership(&self, membership: &CallMembership) -> bool {
        *membership.sender() == *self.own.user_id
            && *membership.device_id() == *self.own.device_id
            && membership.call_id() == self.session.call_id
            && membership.application() == self.session.application
            && membership.scope() == self.session.scope
    }

    fn on_member_update(&mut self, memberships: &[CallMembership]) {
        if self.phase != Phase::Joined
            || self.status.get() != MembershipStatus::Connected
            || !self.membership_published
        {
            return;
        }

        if memberships.iter().any(|membership| self.is_own_membership(membership)) {
            return;
        }

        if self.in_flight.is_some() && !self.is_heartbeat_in_flight() {
            trace!("The membership is already being published");
            return;
        }

        info!("The membership of the device is gone, publishing it again");

        self.generation += 1;
        self.in_flight = None;
        self.scheduled.clear();
        self.retries.clear();
        self.membership_published = false;
        self.created_ts = None;
        // The old lease would remove the new membership when it runs out.
        self.lease_to_cancel = self.delay_id.take();

        self.schedule_now(self.first_action());
    }

    /// Run a local action, or send the request of a remote one.
    fn start_action(&mut self, action: MembershipAction) {
        trace!(?action, "Running an action");

        let transport = self.transport.clone();
        let room_id = self.room_id.clone();
        let state_key = self.state_key.clone();

        let response: BoxFuture<'static, Response> = match action {
            MembershipAction::ProbablyLeftTimeout => {
                self.set_probably_left(true);
                return;
            }
            MembershipAction::SendDelayedLeave => {
                let delay = self.delayed_leave_delay;
                let previous_lease = self.lease_to_cancel.take();

                Box::pin(async move {
                    if let Some(delay_id) = previous_lease {
                        if let Err(error) = transport
                            .update_delayed_event(&delay_id, UpdateDelayedEventAction::Cancel)
                            .await
                        {
                            debug!(%error, "Failed to cancel the previous delayed leave event");
                        }
                    }

                    transport
                        .send_delayed_state_event(
                            &room_id,
                            delay,
                            CALL_MEMBER_EVENT_TYPE,
                            &state_key,
                            json!({}),
                        )
                        .await
                        .map(Some)
                })
            }
            MembershipAction::SendJoin | MembershipAction::UpdateExpiry => {
                let expires = if action == MembershipAction::SendJoin {
                    self.config.membership_expiry
                } else {
                    self.config.membership_expiry.saturating_mul(self.expiry_iterations + 1)
                };
                let created_ts = *self.created_ts.get_or_insert_with(|| self.clock.now_millis());
                let content = self.membership_content(created_ts, expires);

                Box::pin(async move {
                    transport
                        .send_state_event(&room_id, CALL_MEMBER_EVENT_TYPE, &state_key, content)
                        .await
                        .map(|_| None)
                })
            }
            MembershipAction::RestartDelayedLeave => {
                let Some(delay_id) = self.delay_id.clone() else {
                    self.schedule_now(MembershipAction::SendDelayedLeave);
                    return;
                };

                Box::pin(async move {
                    transport
                        .update_delayed_event(&delay_id, UpdateDelayedEventAction::Restart)
                        .await
                        .map(|()| None)
                })
            }
            MembershipAction::SendScheduledDelayedLeave => {
                let Some(delay_id) = self.delay_id.clone() else {
                    if self.membership_published {
                        self.schedule_now(MembershipAction::SendLeave);
                    } else {
                        self.finish_leave();
                    }
                    return;
                };

                Box::pin(async move {
                    transport
                        .update_delayed_event(&delay_id, UpdateDelayedEventAction::Send)
                        .await
                        .map(|()| None)
                })
            }
            MembershipAction::SendLeave => Box::pin(async move {
                transport
                    .send_state_event(&room_id, CALL_MEMBER_EVENT_TYPE, &state_key, json!({}))
                    .await
                    .map(|_| None)
            }),
        };

        self.in_flight = Some(InFlight { action, generation: self.generation, response });
    }

    /// Apply the answer of the server to a request.
    ///
    /// What the server did is always recorded. Follow-up actions are only
    /// scheduled for requests of the current activation.
    fn on_response(&mut self, action: MembershipAction, generation: u64, response: Response) {
        let current = generation == self.generation;

        let result = match action {
            MembershipAction::SendDelayedLeave => self.on_delayed_leave_sent(response, current),
            MembershipAction::SendJoin => self.on_join_sent(response.map(drop), current),
            MembershipAction::RestartDelayedLeave => {
                self.on_delayed_leave_restarted(response.map(drop), current)
            }
            MembershipAction::UpdateExpiry => self.on_expiry_updated(response.map(drop), current),
            MembershipAction::SendScheduledDelayedLeave => {
                self.on_scheduled_leave_sent(response.map(drop), current)
            }
            MembershipAction::SendLeave => self.on_leave_sent(response.map(drop), current),
            MembershipAction::ProbablyLeftTimeout => Ok(()),
        };

        match result {
            Ok(()) => {
                if current {
                    self.retries.remove(&action);
                }
            }
            Err(error) if current => self.handle_error(action, error),
            Err(error) => debug!(?action, %error, "Ignoring the failure of a stale request"),
        }
    }

    fn retry_delay(
        &mut self,
        action: MembershipAction,
        error: TransportError,
    ) -> Result<Duration, MembershipManagerError> {
        let counters = self.retries.entry(action).or_default();

        match error {
            TransportError::RateLimited { retry_after } => {
                counters.rate_limited += 1;

                if counters.rate_limited > self.config.maximum_rate_limit_retry_count {
                    Err(MembershipManagerError::RateLimitRetriesExhausted {
                        action,
                        retries: self.config.maximum_rate_limit_retry_count,
                    })
                } else {
                    Ok(retry_after.unwrap_or(self.config.network_error_retry))
                }
            }
            error if error.is_transient() => {
                counters.network += 1;

                if counters.network > self.config.maximum_network_error_retry_count {
                    Err(MembershipManagerError::NetworkRetriesExhausted {
                        action,
                        retries: self.config.maximum_network_error_retry_count,
                    })
                } else {
                    Ok(self.config.network_error_retry)
                }
            }
            error => Err(MembershipManagerError::Unrecoverable { action, error }),
        }
    }

    fn handle_error(&mut self, action: MembershipAction, error: TransportError) {
        match self.retry_delay(action, error) {
            Ok(delay) => {
                debug!(?action, ?delay, "Retrying an action later");
                self.schedule(action, delay);
            }
            Err(error) if action == MembershipAction::SendScheduledDelayedLeave => {
                warn!(%error, "Failed to send the delayed leave event, sending the leave directly");
                self.delay_id = None;
                self.schedule_now(MembershipAction::SendLeave);
            }
            Err(error) => {
                error!(%error, "The membership manager gives up");
                let _ = self.events.send(MembershipManagerEvent::Error(error));

                if !action.is_leave() {
                    self.generation += 1;
                }
                self.finish_leave();
            }
        }
    }

    fn membership_content(&self, created_ts: u64, expires: Duration) -> JsonValue {
        let focus_active = self
            .join_parameters
            .focus_active
            .clone()
            .unwrap_or_else(ActiveFocus::livekit_oldest_membership);

        let mut content = json!({
            "application": self.session.application,
            "call_id": self.session.call_id,
            "scope": self.session.scope,
            "device_id": self.own.device_id,
            "created_ts": created_ts,
            "expires": u64::try_from(expires.as_millis()).unwrap_or(u64::MAX),
            "focus_active": focus_active,
            "foci_preferred": self.join_parameters.foci_preferred,
        });

        if let Some(intent) = &self.join_parameters.intent {
            content["m.call.intent"] = intent.as_str().into();
        }

        content
    }

    fn on_delayed_leave_sent(
        &mut self,
        response: Response,
        current: bool,
    ) -> Result<(), TransportError> {
        match response {
            Ok(delay_id) => {
                self.delayed_events = DelayedEventsSupport::Supported;
                self.delay_id = delay_id;

                if !current {
                    return Ok(());
                }

                debug!(delay_id = ?self.delay_id, "Scheduled the delayed leave event");
                self.arm_probably_left();

                if self.membership_published {
                    self.schedule(
                        MembershipAction::RestartDelayedLeave,
                        self.config.delayed_leave_restart,
                    );
                } else {
                    self.schedule_now(MembershipAction::SendJoin);
                }

                Ok(())
            }
            Err(TransportError::Unsupported) => {
                info!("The server doesn't support delayed events, relying on the expiry only");

                self.delayed_events = DelayedEventsSupport::Unsupported;

                if current && !self.membership_published {
                    self.schedule_now(MembershipAction::SendJoin);
                }

                Ok(())
            }
            Err(TransportError::MaxDelayExceeded { max_delay }) if !self.max_delay_clamped => {
                warn!(?max_delay, "The delay of the leave event is too long, using the maximum");

                self.delayed_leave_delay = max_delay;
                self.max_delay_clamped = true;

                if current {
                    self.schedule_now(MembershipAction::SendDelayedLeave);
                }

                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn on_join_sent(
        &mut self,
        result: Result<(), TransportError>,
        current: bool,
    ) -> Result<(), TransportError> {
        result?;

        let published_at = Instant::now();
        self.membership_published = true;
        self.published_at = Some(published_at);
        self.expiry_iterations = 1;

        if !current {
            return Ok(());
        }

        debug!("Published the membership");

        self.set_status(MembershipStatus::Connected);
        self.set_probably_left(false);

        self.schedule_at(
            MembershipAction::UpdateExpiry,
            published_at + self.config.membership_expiry.saturating_sub(self.config.expiry_headroom),
        );

        if self.delay_id.is_some() {
            self.schedule(MembershipAction::RestartDelayedLeave, self.config.delayed_leave_restart);
        }

        Ok(())
    }

    fn on_expiry_updated(
        &mut self,
        result: Result<(), TransportError>,
        current: bool,
    ) -> Result<(), TransportError> {
        result?;

        self.expiry_iterations += 1;

        if !current {
            return Ok(());
        }

        debug!(iterations = self.expiry_iterations, "Extended the expiry of the membership");

        let expires = self.config.membership_expiry.saturating_mul(self.expiry_iterations);
        let published_at = *self.published_at.get_or_insert_with(Instant::now);
        self.schedule_at(
            MembershipAction::UpdateExpiry,
            published_at + expires.saturating_sub(self.config.expiry_headroom),
        );

        Ok(())
    }

    fn on_delayed_leave_restarted(
        &mut self,
        result: Result<(), TransportError>,
        current: bool,
    ) -> Result<(), TransportError> {
        match result {
            Ok(()) => {
                if current {
                    trace!("Restarted the delayed leave event");

                    self.set_probably_left(false);
                    self.arm_probably_left();
                    self.schedule(
                        MembershipAction::RestartDelayedLeave,
                        self.config.delayed_leave_restart,
                    );
                }

                Ok(())
            }
            Err(TransportError::NotFound) => {
                warn!("The delayed leave event is gone, publishing the membership again");

                self.delay_id = None;

                if current {
                    self.membership_published = false;
                    self.created_ts = None;
                    self.unschedule(MembershipAction::UpdateExpiry);
                    self.unschedule(MembershipAction::ProbablyLeftTimeout);
                    self.schedule_now(MembershipAction::SendDelayedLeave);
                }

                Ok(())
            }
            Err(TransportError::Unsupported) => {
                info!("The server stopped supporting delayed events, relying on the expiry only");

                self.delayed_events = DelayedEventsSupport::Unsupported;
                self.delay_id = None;

                if current {
                    self.unschedule(MembershipAction::ProbablyLeftTimeout);
                }

                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn on_scheduled_leave_sent(
        &mut self,
        result: Result<(), TransportError>,
        current: bool,
    ) -> Result<(), TransportError> {
        if !current {
            return Ok(());
        }

        match result {
            Ok(()) => {
                debug!("The server sent the delayed leave event");
                self.finish_leave();
                Ok(())
            }
            Err(error) if matches!(error, TransportError::RateLimited { .. }) || error.is_transient() => {
                Err(error)
            }
            Err(error) => {
                warn!(%error, "Failed to send the delayed leave event, sending the leave directly");

                self.delay_id = None;

                if self.membership_published {
                    self.schedule_now(MembershipAction::SendLeave);
                } else {
                    self.finish_leave();
                }

                Ok(())
            }
        }
    }

    fn on_leave_sent(
        &mut self,
        result: Result<(), TransportError>,
        current: bool,
    ) -> Result<(), TransportError> {
        result?;

        if current {
            debug!("Published the empty membership");
            self.finish_leave();
        }

        Ok(())
    }
}
