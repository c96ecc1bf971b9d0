//! Wire messages exchanged over the broadcast medium.
//!
//! Two message kinds exist, discriminated only by their namespaced event type:
//!
//! | Event type | Direction | Detail |
//! |---|---|---|
//! | `<ns>:requestProvider` | consumer -> all | none |
//! | `<ns>:announceProvider` | announcer -> all | `{ info, capability }` |
//!
//! The `info` object travels as untrusted JSON. Anything on the medium may
//! publish, so decoding validates it before a registry ever sees a record.

use std::fmt;

use crate::record::{Capability, ProviderInfo, ProviderRecord};

const REQUEST_SUFFIX: &str = "requestProvider";
const ANNOUNCE_SUFFIX: &str = "announceProvider";

/// Protocol prefix for event types, keeping discovery traffic apart from
/// unrelated broadcasts on the same medium.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    /// Default namespace.
    pub const DEFAULT: &'static str = "eip6963";

    /// Create a namespace from a prefix such as `"eip6963"`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// The bare prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Event type for discovery requests.
    ///
    /// `eip6963` -> `eip6963:requestProvider`
    pub fn request_event(&self) -> String {
        format!("{}:{REQUEST_SUFFIX}", self.0)
    }

    /// Event type for provider announcements.
    ///
    /// `eip6963` -> `eip6963:announceProvider`
    pub fn announce_event(&self) -> String {
        format!("{}:{ANNOUNCE_SUFFIX}", self.0)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload attached to an announce event.
#[derive(Debug, Clone)]
pub struct EventDetail {
    /// Untrusted provider descriptor.
    pub info: serde_json::Value,
    /// Provider handle, passed through untouched.
    pub capability: Option<Capability>,
}

/// A raw event as it travels on the medium.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event type string; the sole discriminator between message kinds.
    pub kind: String,
    /// Optional payload.
    pub detail: Option<EventDetail>,
}

impl Event {
    /// An event with no payload.
    pub fn signal(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: None,
        }
    }

    /// An event carrying a payload.
    pub fn with_detail(kind: impl Into<String>, detail: EventDetail) -> Self {
        Self {
            kind: kind.into(),
            detail: Some(detail),
        }
    }
}

/// Discovery protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask every announcer to (re-)announce.
    RequestProvider,
    /// One announcer making its record discoverable.
    AnnounceProvider(ProviderRecord),
}

impl Message {
    /// Encode into a medium event under `namespace`.
    pub fn to_event(&self, namespace: &Namespace) -> Event {
        match self {
            Message::RequestProvider => Event::signal(namespace.request_event()),
            Message::AnnounceProvider(record) => {
                Event::with_detail(
                    namespace.announce_event(),
                    EventDetail {
                        info: record.info().to_json(),
                        capability: Some(record.capability().clone()),
                    },
                )
            }
        }
    }

    /// Decode a medium event.
    ///
    /// Returns `Ok(None)` for traffic that is not ours (other namespaces or
    /// unrelated event types), and `Err` when an announce is malformed.
    pub fn from_event(event: &Event, namespace: &Namespace) -> Result<Option<Self>, DecodeError> {
        let Some(suffix) = event
            .kind
            .strip_prefix(namespace.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
        else {
            return Ok(None);
        };

        match suffix {
            REQUEST_SUFFIX => Ok(Some(Message::RequestProvider)),
            ANNOUNCE_SUFFIX => decode_announce(event).map(|r| Some(Message::AnnounceProvider(r))),
            _ => Ok(None),
        }
    }
}

fn decode_announce(event: &Event) -> Result<ProviderRecord, DecodeError> {
    let detail = event.detail.as_ref().ok_or(DecodeError::MissingDetail)?;
    let info = ProviderInfo::deserialize_untrusted(&detail.info)?;
    let capability = detail
        .capability
        .clone()
        .ok_or(DecodeError::MissingCapability)?;
    Ok(ProviderRecord::new(info, capability))
}

impl ProviderInfo {
    fn deserialize_untrusted(value: &serde_json::Value) -> Result<Self, DecodeError> {
        let info: ProviderInfo = serde::Deserialize::deserialize(value)?;
        info.validate()?;
        Ok(info)
    }
}

/// Why an announce message was rejected.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Announce event without a payload.
    #[error("announce event has no detail")]
    MissingDetail,
    /// Announce payload without a provider handle.
    #[error("announce detail has no capability")]
    MissingCapability,
    /// Info object missing a field or holding the wrong type.
    #[error("failed to decode provider info: {0}")]
    Json(#[from] serde_json::Error),
    /// Info object present but a field fails validation.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Wire name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl DecodeError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}
