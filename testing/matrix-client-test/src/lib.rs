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
#![warn(missing_debug_implementations)]

use once_cell::sync::Lazy;
use ruma::{device_id, room_id, user_id, DeviceId, RoomId, UserId};

mod call;
mod sync_builder;

pub use self::{
    call::{
        call_member_event, left_call_member_event, sticky_call_member_event, CallMemberEventBuilder,
    },
    sync_builder::{InvitedRoomBuilder, JoinedRoomBuilder, SyncResponseBuilder},
};

#[doc(hidden)]
pub use ctor as __ctor;

pub static ALICE: Lazy<&UserId> = Lazy::new(|| user_id!("@alice:server.name"));
pub static BOB: Lazy<&UserId> = Lazy::new(|| user_id!("@bob:other.server"));
pub static CAROL: Lazy<&UserId> = Lazy::new(|| user_id!("@carol:other.server"));

pub static ALICE_DEVICE: Lazy<&DeviceId> = Lazy::new(|| device_id!("ALICEDEVICE"));
pub static BOB_DEVICE: Lazy<&DeviceId> = Lazy::new(|| device_id!("BOBDEVICE"));
pub static CAROL_DEVICE: Lazy<&DeviceId> = Lazy::new(|| device_id!("CAROLDEVICE"));

/// The room most tests put their calls in.
pub static DEFAULT_TEST_ROOM_ID: Lazy<&RoomId> =
    Lazy::new(|| room_id!("!SVkFJHzfwvuaIEawgC:localhost"));

/// Install a `tracing` subscriber that writes to the test output, filtered
/// with the `RUST_LOG` environment variable.
///
/// Installing a second subscriber is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Enable tracing for the integration tests of the file this macro is called
/// in.
#[macro_export]
macro_rules! init_tracing_for_tests {
    () => {
        #[$crate::__ctor::ctor]
        fn init_logging() {
            $crate::init_tracing();
        }
    };
}
