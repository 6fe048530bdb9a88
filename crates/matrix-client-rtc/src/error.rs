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

use std::time::Duration;

use thiserror::Error;

use crate::membership_manager::MembershipAction;

/// An error returned by an [`RtcTransport`](crate::RtcTransport).
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransportError {
    /// The server rate limited the request.
    #[error("the request was rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// How long the server asked to wait before retrying.
        retry_after: Option<Duration>,
    },

    /// The server doesn't know about the resource, usually a delayed event
    /// that was already sent or cancelled.
    #[error("the resource wasn't found")]
    NotFound,

    /// The server, or the host embedding the client, doesn't support the
    /// endpoint.
    #[error("the endpoint isn't supported")]
    Unsupported,

    /// The requested delay of a delayed event is longer than the server
    /// allows.
    #[error("the delay exceeds the maximum of the server ({max_delay:?})")]
    MaxDelayExceeded {
        /// The longest delay the server accepts.
        max_delay: Duration,
    },

    /// Any other error response of the server.
    #[error("the server responded with {status}: {message}")]
    Http { status: u16, message: String },

    /// The request didn't reach the server, or the response didn't come
    /// back.
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Whether retrying the same request later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500,
            Self::Network(_) => true,
            _ => false,
        }
    }
}

/// A call membership that can't be used.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MembershipError {
    /// A required field is missing, or isn't a string.
    #[error("the membership is missing the `{0}` field")]
    MissingField(&'static str),

    /// Neither `expires` nor `expires_ts` is present.
    #[error("the membership has no expiry")]
    MissingExpiry,

    /// `expires` or `expires_ts` isn't a non-negative integer.
    #[error("the `{0}` field of the membership isn't a valid timestamp")]
    InvalidExpiry(&'static str),

    /// The event hosting the membership is malformed.
    #[error("the membership event is malformed: {0}")]
    InvalidEvent(&'static str),
}

/// An error that made the [`MembershipManager`] give up.
///
/// The manager is disconnected once one of those is reported.
///
/// [`MembershipManager`]: crate::MembershipManager
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MembershipManagerError {
    /// The server kept rate limiting an action.
    #[error("{action:?} was rate limited {retries} times in a row")]
    RateLimitRetriesExhausted { action: MembershipAction, retries: u32 },

    /// An action kept failing because of the network or the server.
    #[error("{action:?} failed {retries} times in a row")]
    NetworkRetriesExhausted { action: MembershipAction, retries: u32 },

    /// An action failed in a way retrying won't fix.
    #[error("{action:?} failed: {error}")]
    Unrecoverable {
        action: MembershipAction,
        #[source]
        error: TransportError,
    },
}

/// An error of a [`KeyTransport`](crate::encryption::KeyTransport).
#[derive(Clone, Debug, Error, PartialEq)]
pub enum KeyTransportError {
    /// The channel can't be used at all, for instance because the host
    /// embedding the client doesn't allow sending to-device messages.
    #[error("the key transport isn't supported")]
    Unsupported,

    /// Sending the keys failed.
    #[error(transparent)]
    Transport(TransportError),

    /// The keys couldn't be serialized.
    #[error("failed to serialize the keys: {0}")]
    Serialization(String),
}

impl From<TransportError> for KeyTransportError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Unsupported => Self::Unsupported,
            error => Self::Transport(error),
        }
    }
}
