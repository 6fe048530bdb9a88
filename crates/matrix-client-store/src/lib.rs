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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_debug_implementations)]

mod accumulator;
mod config;
mod error;
pub mod store;
mod sync;

pub use self::{
    accumulator::{SavedRooms, SavedSync, SyncAccumulator},
    config::{StoreConfig, DEFAULT_MAX_TIMELINE_ENTRIES, DEFAULT_WRITE_DELAY},
    error::{Result, StoreError, SyncError},
    sync::{
        Events, InvitedRoom, JoinedRoom, JsonObject, KnockedRoom, RoomSummary, Rooms,
        SyncResponse, Timeline, UnreadNotificationsCount,
    },
};

#[cfg(test)]
matrix_client_test::init_tracing_for_tests!();
