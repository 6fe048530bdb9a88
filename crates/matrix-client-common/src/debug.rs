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

//! Helpers for `Debug` implementations that must not dump whole events or
//! key material into the logs.

use std::fmt;

use serde_json::Value as JsonValue;

/// A wrapper around a raw JSON event that implements `Debug` in a way that
/// only prints the event ID and event type.
pub struct DebugJsonEvent<'a>(pub &'a JsonValue);

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for DebugJsonEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawEvent")
            .field("event_id", &DebugField(self.0.get("event_id")))
            .field("event_type", &DebugField(self.0.get("type")))
            .finish_non_exhaustive()
    }
}

/// A wrapper around a list of raw JSON events that implements `Debug` by
/// delegating to [`DebugJsonEvent`] for every entry.
pub struct DebugListOfJsonEvents<'a>(pub &'a [JsonValue]);

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for DebugListOfJsonEvents<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter().map(DebugJsonEvent)).finish()
    }
}

struct DebugField<'a>(Option<&'a JsonValue>);

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for DebugField<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(JsonValue::String(s)) => s.fmt(f),
            Some(other) => f.debug_tuple("Invalid").field(other).finish(),
            None => f.write_str("Missing"),
        }
    }
}

/// A wrapper that only prints the length of a secret byte buffer.
pub struct DebugSecret<'a>(pub &'a [u8]);

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for DebugSecret<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} secret bytes>", self.0.len())
    }
}

pub trait DebugStructExt {
    /// Add a field only if it is `Some(_)`.
    fn maybe_field<T: fmt::Debug>(&mut self, name: &str, value: &Option<T>) -> &mut Self;
}

impl DebugStructExt for fmt::DebugStruct<'_, '_> {
    fn maybe_field<T: fmt::Debug>(&mut self, name: &str, value: &Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.field(name, value);
        }

        self
    }
}
