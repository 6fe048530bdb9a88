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

pub mod encryption;
mod error;
mod membership;
pub mod membership_manager;
mod session;
mod session_manager;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod transport;

pub use self::{
    encryption::{CallEncryption, EncryptionConfig, EncryptionKeyChanged},
    error::{KeyTransportError, MembershipError, MembershipManagerError, TransportError},
    membership::{
        call_memberships_from_state_event, ActiveFocus, CallMembership, Focus, MembershipSource,
        ParticipantId, ReceiptTiming, OLDEST_MEMBERSHIP_FOCUS_SELECTION,
    },
    membership_manager::{
        MembershipAction, MembershipConfig, MembershipManager, MembershipManagerEvent,
        MembershipStatus,
    },
    session::{EncryptionMode, KeyTransportKind, MatrixRtcSession, RtcConfig, SessionConfig},
    session_manager::{MatrixRtcSessionManager, SessionManagerEvent},
    transport::{
        RtcTransport, UpdateDelayedEventAction, CALL_MEMBER_EVENT_TYPE,
        ENCRYPTION_KEYS_EVENT_TYPE,
    },
};

#[cfg(test)]
matrix_client_test::init_tracing_for_tests!();
