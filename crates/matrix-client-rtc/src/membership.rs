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

//! Call memberships, as found in `m.call.member` state and sticky events.

use std::fmt;

use matrix_client_common::time::{now_millis, Clock};
use ruma::{DeviceId, OwnedDeviceId, OwnedEventId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::error::MembershipError;

/// The `focus_selection` asking to use the focus of the oldest membership.
pub const OLDEST_MEMBERSHIP_FOCUS_SELECTION: &str = "oldest_membership";

/// A device taking part in a call.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ParticipantId {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
}

impl ParticipantId {
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self { user_id: user_id.to_owned(), device_id: device_id.to_owned() }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.device_id)
    }
}

/// A server a participant can use for the media of the call.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Focus {
    #[serde(rename = "type")]
    pub focus_type: String,
    #[serde(flatten)]
    pub data: Map<String, JsonValue>,
}

impl Focus {
    /// A LiveKit SFU focus.
    pub fn livekit(service_url: &str, alias: &str) -> Self {
        let mut data = Map::new();
        data.insert("livekit_service_url".to_owned(), service_url.into());
        data.insert("livekit_alias".to_owned(), alias.into());

        Self { focus_type: "livekit".to_owned(), data }
    }
}

/// How a participant picks the focus it actually connects to.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ActiveFocus {
    #[serde(rename = "type")]
    pub focus_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_selection: Option<String>,
}

impl ActiveFocus {
    /// Use the LiveKit focus of the oldest membership of the call.
    pub fn livekit_oldest_membership() -> Self {
        Self {
            focus_type: "livekit".to_owned(),
            focus_selection: Some(OLDEST_MEMBERSHIP_FOCUS_SELECTION.to_owned()),
        }
    }
}

/// Where a membership was read from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MembershipSource {
    /// A `m.call.member` state event.
    State,
    /// A sticky event, which is preferred over state for the same identity.
    Sticky,
}

/// When the event of a membership was received, and how old it was then.
///
/// The difference between the local and the server clock is derived from it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReceiptTiming {
    /// Local time at which the event was received.
    pub local_receipt_ts: u64,
    /// The `origin_server_ts` of the event.
    pub server_ts: u64,
    /// The `unsigned.age` of the event when it was received.
    pub local_age: u64,
}

impl ReceiptTiming {
    /// How far ahead of the server clock the local clock is, in milliseconds.
    pub fn clock_offset(&self) -> i64 {
        let local_send_ts = i128::from(self.local_receipt_ts) - i128::from(self.local_age);
        let offset = local_send_ts - i128::from(self.server_ts);

        offset.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Expiry {
    /// Milliseconds after `created_ts`.
    Relative(u64),
    /// Server timestamp.
    Absolute(u64),
}

/// The membership of a device in a call.
///
/// Memberships are immutable: a newer event for the same identity produces a
/// new `CallMembership` replacing the old one.
#[derive(Clone, Debug, PartialEq)]
pub struct CallMembership {
    sender: OwnedUserId,
    event_id: Option<OwnedEventId>,
    state_key: Option<String>,
    sticky_key: Option<String>,
    source: MembershipSource,
    device_id: OwnedDeviceId,
    call_id: String,
    scope: String,
    application: String,
    created_ts: u64,
    expiry: Expiry,
    timing: ReceiptTiming,
    foci_preferred: Vec<Focus>,
    focus_active: Option<ActiveFocus>,
    intent: Option<String>,
}

fn required_str<'a>(
    object: &'a Map<String, JsonValue>,
    field: &'static str,
) -> Result<&'a str, MembershipError> {
    object.get(field).and_then(JsonValue::as_str).ok_or(MembershipError::MissingField(field))
}

fn optional_ts(
    object: &Map<String, JsonValue>,
    field: &'static str,
) -> Result<Option<u64>, MembershipError> {
    match object.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or(MembershipError::InvalidExpiry(field)),
    }
}

/// The envelope of an event carrying memberships.
struct EventMeta {
    sender: OwnedUserId,
    event_id: Option<OwnedEventId>,
    state_key: Option<String>,
    timing: ReceiptTiming,
}

impl EventMeta {
    fn parse(event: &JsonValue, local_receipt_ts: u64) -> Result<Self, MembershipError> {
        let sender = event
            .get("sender")
            .and_then(JsonValue::as_str)
            .and_then(|sender| UserId::parse(sender).ok())
            .ok_or(MembershipError::InvalidEvent("sender"))?;
        let server_ts = event
            .get("origin_server_ts")
            .and_then(JsonValue::as_u64)
            .ok_or(MembershipError::InvalidEvent("origin_server_ts"))?;
        let local_age = event.pointer("/unsigned/age").and_then(JsonValue::as_u64).unwrap_or(0);
        let event_id = event
            .get("event_id")
            .and_then(JsonValue::as_str)
            .and_then(|event_id| OwnedEventId::try_from(event_id).ok());
        let state_key = event.get("state_key").and_then(JsonValue::as_str).map(ToOwned::to_owned);

        Ok(Self {
            sender,
            event_id,
            state_key,
            timing: ReceiptTiming { local_receipt_ts, server_ts, local_age },
        })
    }
}

impl CallMembership {
    /// Read the membership of a state or sticky event.
    ///
    /// `local_receipt_ts` is the local time at which the event was received.
    pub fn from_event(
        event: &JsonValue,
        source: MembershipSource,
        local_receipt_ts: u64,
    ) -> Result<Self, MembershipError> {
        let meta = EventMeta::parse(event, local_receipt_ts)?;
        let content = event
            .get("content")
            .and_then(JsonValue::as_object)
            .ok_or(MembershipError::InvalidEvent("content"))?;

        Self::from_content(&meta, content, source)
    }

    fn from_content(
        meta: &EventMeta,
        content: &Map<String, JsonValue>,
        source: MembershipSource,
    ) -> Result<Self, MembershipError> {
        let device_id = required_str(content, "device_id")?.into();
        let call_id = required_str(content, "call_id")?.to_owned();
        let scope = required_str(content, "scope")?.to_owned();
        let application = required_str(content, "application")?.to_owned();

        let expires = optional_ts(content, "expires")?;
        let expires_ts = optional_ts(content, "expires_ts")?;

        let expiry = match (expires_ts, expires) {
            (Some(expires_ts), _) => Expiry::Absolute(expires_ts),
            (None, Some(expires)) => Expiry::Relative(expires),
            (None, None) => return Err(MembershipError::MissingExpiry),
        };

        let created_ts = content
            .get("created_ts")
            .and_then(JsonValue::as_u64)
            .unwrap_or(meta.timing.server_ts);

        let foci_preferred = content
            .get("foci_preferred")
            .and_then(JsonValue::as_array)
            .map(|foci| {
                foci.iter()
                    .filter_map(|focus| match serde_json::from_value(focus.clone()) {
                        Ok(focus) => Some(focus),
                        Err(error) => {
                            warn!(%error, "Ignoring a malformed preferred focus");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let focus_active = content
            .get("focus_active")
            .and_then(|focus| serde_json::from_value(focus.clone()).ok());

        let intent =
            content.get("m.call.intent").and_then(JsonValue::as_str).map(ToOwned::to_owned);

        let sticky_key = match source {
            MembershipSource::State => None,
            MembershipSource::Sticky => content
                .get("msc4354_sticky_key")
                .and_then(JsonValue::as_str)
                .map(ToOwned::to_owned),
        };

        Ok(Self {
            sender: meta.sender.clone(),
            event_id: meta.event_id.clone(),
            state_key: meta.state_key.clone(),
            sticky_key,
            source,
            device_id,
            call_id,
            scope,
            application,
            created_ts,
            expiry,
            timing: meta.timing,
            foci_preferred,
            focus_active,
            intent,
        })
    }

    pub fn sender(&self) -> &UserId {
        &self.sender
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn event_id(&self) -> Option<&OwnedEventId> {
        self.event_id.as_ref()
    }

    /// The state key of the event, for memberships read from state.
    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    /// The sticky key of the event, for memberships read from sticky events.
    pub fn sticky_key(&self) -> Option<&str> {
        self.sticky_key.as_deref()
    }

    pub fn source(&self) -> MembershipSource {
        self.source
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn timing(&self) -> ReceiptTiming {
        self.timing
    }

    /// When the membership was created, on the server clock.
    ///
    /// This is the `created_ts` of the content if present, and the timestamp
    /// of the event otherwise.
    pub fn created_ts(&self) -> u64 {
        self.created_ts
    }

    pub fn participant(&self) -> ParticipantId {
        ParticipantId::new(&self.sender, &self.device_id)
    }

    /// The `{user_id}:{device_id}` string identifying the device of this
    /// membership.
    pub fn participant_id(&self) -> String {
        self.participant().to_string()
    }

    /// Whether both memberships are about the same device in the same call.
    pub fn is_same_identity(&self, other: &CallMembership) -> bool {
        self.sender == other.sender
            && self.device_id == other.device_id
            && self.call_id == other.call_id
            && self.scope == other.scope
            && self.application == other.application
    }

    pub fn preferred_foci(&self) -> &[Focus] {
        &self.foci_preferred
    }

    pub fn focus_active(&self) -> Option<&ActiveFocus> {
        self.focus_active.as_ref()
    }

    /// The `m.call.intent` of the membership, e.g. `audio` or `video`.
    pub fn intent(&self) -> Option<&str> {
        self.intent.as_deref()
    }

    /// When the membership expires, on the server clock.
    pub fn absolute_expiry(&self) -> u64 {
        match self.expiry {
            Expiry::Relative(expires) => self.created_ts.saturating_add(expires),
            Expiry::Absolute(expires_ts) => expires_ts,
        }
    }

    /// When the membership expires, on the local clock.
    pub fn local_expiry(&self) -> u64 {
        self.absolute_expiry().saturating_add_signed(self.timing.clock_offset())
    }

    /// How long until the membership expires, negative if it already did.
    pub fn ms_until_expiry(&self, now: u64) -> i64 {
        let remaining = i128::from(self.local_expiry()) - i128::from(now);
        remaining.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }

    /// Whether the membership expired at the local time `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.ms_until_expiry(now) <= 0
    }

    /// [`ms_until_expiry`](Self::ms_until_expiry) according to the given
    /// clock.
    pub fn ms_until_expiry_with(&self, clock: &dyn Clock) -> i64 {
        self.ms_until_expiry(clock.now_millis())
    }

    pub fn ms_until_expiry_now(&self) -> i64 {
        self.ms_until_expiry(now_millis())
    }

    pub fn is_expired_now(&self) -> bool {
        self.is_expired(now_millis())
    }
}

/// Read all the memberships of a call member state event.
///
/// An empty content means the device left, and yields no membership. Events
/// in the legacy format hold a list of memberships under `memberships`.
pub fn call_memberships_from_state_event(
    event: &JsonValue,
    local_receipt_ts: u64,
) -> Result<Vec<CallMembership>, MembershipError> {
    let meta = EventMeta::parse(event, local_receipt_ts)?;
    let content = event
        .get("content")
        .and_then(JsonValue::as_object)
        .ok_or(MembershipError::InvalidEvent("content"))?;

    if content.is_empty() {
        return Ok(Vec::new());
    }

    match content.get("memberships") {
        Some(JsonValue::Array(memberships)) => memberships
            .iter()
            .map(|membership| {
                let content =
                    membership.as_object().ok_or(MembershipError::InvalidEvent("memberships"))?;
                CallMembership::from_content(&meta, content, MembershipSource::State)
            })
            .collect(),
        Some(_) => Err(MembershipError::InvalidEvent("memberships")),
        None => Ok(vec![CallMembership::from_content(&meta, content, MembershipSource::State)?]),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use matrix_client_test::{
        left_call_member_event, CallMemberEventBuilder, ALICE, ALICE_DEVICE, BOB, BOB_DEVICE,
    };
    use serde_json::json;

    use super::{
        call_memberships_from_state_event, CallMembership, Focus, MembershipSource,
        OLDEST_MEMBERSHIP_FOCUS_SELECTION,
    };
    use crate::error::MembershipError;

    fn parse(event: serde_json::Value) -> Result<CallMembership, MembershipError> {
        CallMembership::from_event(&event, MembershipSource::State, 1000)
    }

    fn without(mut event: serde_json::Value, field: &str) -> serde_json::Value {
        event["content"].as_object_mut().unwrap().remove(field);
        event
    }

    #[test]
    fn test_relative_and_absolute_expiry_agree() {
        let relative = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE)
            .origin_server_ts(1000)
            .expires(json!(5000))
            .into_state_event();
        let absolute = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE)
            .origin_server_ts(1000)
            .expires_ts(json!(6000))
            .into_state_event();

        assert_eq!(parse(relative).unwrap().absolute_expiry(), 6000);
        assert_eq!(parse(absolute).unwrap().absolute_expiry(), 6000);
    }

    #[test]
    fn test_created_ts_overrides_the_event_timestamp() {
        let event = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE)
            .origin_server_ts(1000)
            .created_ts(500)
            .expires(json!(5000))
            .into_state_event();

        let membership = parse(event).unwrap();
        assert_eq!(membership.created_ts(), 500);
        assert_eq!(membership.absolute_expiry(), 5500);
    }

    #[test]
    fn test_invalid_memberships_are_rejected() {
        let event = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE).into_state_event();

        assert_matches!(
            parse(without(event.clone(), "device_id")),
            Err(MembershipError::MissingField("device_id"))
        );
        assert_matches!(
            parse(without(event.clone(), "call_id")),
            Err(MembershipError::MissingField("call_id"))
        );
        assert_matches!(
            parse(without(event, "scope")),
            Err(MembershipError::MissingField("scope"))
        );

        let no_expiry =
            CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE).without_expiry().into_state_event();
        assert_matches!(parse(no_expiry), Err(MembershipError::MissingExpiry));

        let bad_expires = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE)
            .expires(json!("5000"))
            .into_state_event();
        assert_matches!(parse(bad_expires), Err(MembershipError::InvalidExpiry("expires")));

        let bad_expires_ts = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE)
            .expires_ts(json!({ "ts": 6000 }))
            .into_state_event();
        assert_matches!(parse(bad_expires_ts), Err(MembershipError::InvalidExpiry("expires_ts")));
    }

    #[test]
    fn test_local_expiry_follows_the_clock_offset() {
        // Sent at 1000 on the server clock, received 200ms later at 10_000 on
        // the local clock: the local clock is 8_800ms ahead.
        let event = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE)
            .origin_server_ts(1000)
            .age(200)
            .expires(json!(5000))
            .into_state_event();

        let membership = CallMembership::from_event(&event, MembershipSource::State, 10_000)
            .expect("the membership should be valid");

        assert_eq!(membership.timing().clock_offset(), 8_800);
        assert_eq!(membership.absolute_expiry(), 6000);
        assert_eq!(membership.local_expiry(), 14_800);
        assert_eq!(membership.ms_until_expiry(10_000), 4_800);
        assert!(!membership.is_expired(14_799));
        assert!(membership.is_expired(14_800));
    }

    #[test]
    fn test_membership_accessors() {
        let event = CallMemberEventBuilder::new(&BOB, &BOB_DEVICE).intent("video").into_state_event();
        let membership = parse(event).unwrap();

        assert_eq!(membership.participant_id(), "@bob:other.server:BOBDEVICE");
        assert_eq!(membership.intent(), Some("video"));
        assert_eq!(membership.state_key(), Some("_@bob:other.server_BOBDEVICE"));
        assert_eq!(
            membership.preferred_foci(),
            [Focus::livekit("https://livekit.example.org", "!SVkFJHzfwvuaIEawgC:localhost")]
        );
        assert_eq!(
            membership.focus_active().and_then(|focus| focus.focus_selection.as_deref()),
            Some(OLDEST_MEMBERSHIP_FOCUS_SELECTION)
        );
    }

    #[test]
    fn test_sticky_memberships_keep_their_key() {
        let event = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE).into_sticky_event();
        let membership = CallMembership::from_event(&event, MembershipSource::Sticky, 1000).unwrap();

        assert_eq!(membership.source(), MembershipSource::Sticky);
        assert_eq!(membership.sticky_key(), Some("_@alice:server.name_ALICEDEVICE"));
        assert_eq!(membership.state_key(), None);

        let state = parse(CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE).into_state_event())
            .unwrap();
        assert!(membership.is_same_identity(&state));
    }

    #[test]
    fn test_state_events_expand_to_memberships() {
        let left = left_call_member_event(&ALICE, &ALICE_DEVICE);
        assert_eq!(call_memberships_from_state_event(&left, 1000).unwrap(), Vec::new());

        let single = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE).into_state_event();
        assert_eq!(call_memberships_from_state_event(&single, 1000).unwrap().len(), 1);

        let first = CallMemberEventBuilder::new(&ALICE, &ALICE_DEVICE).content();
        let second = CallMemberEventBuilder::new(&ALICE, "OTHERDEVICE".into()).content();
        let mut legacy = single;
        legacy["content"] = json!({ "memberships": [first, second] });

        let memberships = call_memberships_from_state_event(&legacy, 1000).unwrap();
        assert_eq!(memberships.len(), 2);
        assert_eq!(memberships[1].device_id().as_str(), "OTHERDEVICE");
    }
}
