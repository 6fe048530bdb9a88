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

//! Factories for `org.matrix.msc3401.call.member` events.

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde_json::{json, Value as JsonValue};

/// The event type of call membership events.
const CALL_MEMBER_EVENT_TYPE: &str = "org.matrix.msc3401.call.member";

/// Builder for raw call membership events.
///
/// By default the membership belongs to the room call (`call_id = ""`,
/// `scope = "m.room"`, `application = "m.call"`), has a relative expiry of 4
/// hours and is sent at `origin_server_ts = 1000` with an `age` of 0.
#[derive(Clone, Debug)]
pub struct CallMemberEventBuilder {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    call_id: String,
    application: String,
    created_ts: Option<u64>,
    expires: Option<JsonValue>,
    expires_ts: Option<JsonValue>,
    origin_server_ts: u64,
    age: u64,
    event_id: Option<String>,
    state_key: Option<String>,
    intent: Option<String>,
    foci_preferred: JsonValue,
}

impl CallMemberEventBuilder {
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            call_id: String::new(),
            application: "m.call".to_owned(),
            created_ts: None,
            expires: Some(json!(14_400_000)),
            expires_ts: None,
            origin_server_ts: 1000,
            age: 0,
            event_id: None,
            state_key: None,
            intent: None,
            foci_preferred: json!([{
                "type": "livekit",
                "livekit_service_url": "https://livekit.example.org",
                "livekit_alias": "!SVkFJHzfwvuaIEawgC:localhost",
            }]),
        }
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.call_id = call_id.to_owned();
        self
    }

    pub fn application(mut self, application: &str) -> Self {
        self.application = application.to_owned();
        self
    }

    pub fn created_ts(mut self, created_ts: u64) -> Self {
        self.created_ts = Some(created_ts);
        self
    }

    /// Set the relative expiry, any JSON value is accepted so malformed
    /// memberships can be built too.
    pub fn expires(mut self, expires: JsonValue) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Set the absolute expiry and remove the relative one.
    pub fn expires_ts(mut self, expires_ts: JsonValue) -> Self {
        self.expires = None;
        self.expires_ts = Some(expires_ts);
        self
    }

    pub fn without_expiry(mut self) -> Self {
        self.expires = None;
        self.expires_ts = None;
        self
    }

    pub fn origin_server_ts(mut self, origin_server_ts: u64) -> Self {
        self.origin_server_ts = origin_server_ts;
        self
    }

    pub fn age(mut self, age: u64) -> Self {
        self.age = age;
        self
    }

    pub fn event_id(mut self, event_id: &str) -> Self {
        self.event_id = Some(event_id.to_owned());
        self
    }

    /// Override the state key, which defaults to `_{user_id}_{device_id}`.
    pub fn state_key(mut self, state_key: &str) -> Self {
        self.state_key = Some(state_key.to_owned());
        self
    }

    pub fn intent(mut self, intent: &str) -> Self {
        self.intent = Some(intent.to_owned());
        self
    }

    pub fn foci_preferred(mut self, foci_preferred: JsonValue) -> Self {
        self.foci_preferred = foci_preferred;
        self
    }

    /// The membership content, without the event envelope.
    pub fn content(&self) -> JsonValue {
        let mut content = json!({
            "application": self.application,
            "call_id": self.call_id,
            "scope": "m.room",
            "device_id": self.device_id,
            "focus_active": { "type": "livekit", "focus_selection": "oldest_membership" },
            "foci_preferred": self.foci_preferred,
        });

        if let Some(expires) = &self.expires {
            content["expires"] = expires.clone();
        }
        if let Some(expires_ts) = &self.expires_ts {
            content["expires_ts"] = expires_ts.clone();
        }
        if let Some(created_ts) = self.created_ts {
            content["created_ts"] = created_ts.into();
        }
        if let Some(intent) = &self.intent {
            content["m.call.intent"] = intent.as_str().into();
        }

        content
    }

    fn default_state_key(&self) -> String {
        format!("_{}_{}", self.user_id, self.device_id)
    }

    fn default_event_id(&self) -> String {
        format!("$call_member_{}_{}", self.device_id, self.origin_server_ts)
    }

    /// Build the membership as a state event.
    pub fn into_state_event(self) -> JsonValue {
        json!({
            "type": CALL_MEMBER_EVENT_TYPE,
            "state_key": self.state_key.clone().unwrap_or_else(|| self.default_state_key()),
            "sender": self.user_id,
            "event_id": self.event_id.clone().unwrap_or_else(|| self.default_event_id()),
            "origin_server_ts": self.origin_server_ts,
            "content": self.content(),
            "unsigned": { "age": self.age },
        })
    }

    /// Build the membership as a sticky event.
    pub fn into_sticky_event(self) -> JsonValue {
        let mut content = self.content();
        content["msc4354_sticky_key"] =
            self.state_key.clone().unwrap_or_else(|| self.default_state_key()).into();

        json!({
            "type": CALL_MEMBER_EVENT_TYPE,
            "sender": self.user_id,
            "event_id": self.event_id.clone().unwrap_or_else(|| self.default_event_id()),
            "origin_server_ts": self.origin_server_ts,
            "msc4354_sticky": { "duration_ms": 3_600_000 },
            "content": content,
            "unsigned": { "age": self.age },
        })
    }
}

/// A call membership state event with the default values of
/// [`CallMemberEventBuilder`].
pub fn call_member_event(user_id: &UserId, device_id: &DeviceId) -> JsonValue {
    CallMemberEventBuilder::new(user_id, device_id).into_state_event()
}

/// A sticky call membership event with the default values of
/// [`CallMemberEventBuilder`].
pub fn sticky_call_member_event(user_id: &UserId, device_id: &DeviceId) -> JsonValue {
    CallMemberEventBuilder::new(user_id, device_id).into_sticky_event()
}

/// An empty call membership state event, which is how a device leaves a
/// call.
pub fn left_call_member_event(user_id: &UserId, device_id: &DeviceId) -> JsonValue {
    json!({
        "type": CALL_MEMBER_EVENT_TYPE,
        "state_key": format!("_{user_id}_{device_id}"),
        "sender": user_id,
        "event_id": format!("$call_member_left_{device_id}"),
        "origin_server_ts": 2000,
        "content": {},
        "unsigned": { "age": 0 },
    })
}
