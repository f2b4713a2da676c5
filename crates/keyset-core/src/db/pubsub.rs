//! Module: db::pubsub
//! Responsibility: client-side subscription bookkeeping for publish/subscribe
//! connections, driven by discrete request/response steps.
//! Does not own: the transport. Callers send the returned requests and feed
//! every server reply back through `Subscriber::handle`.
//! Invariants: a name is `Confirmed` only after the server acknowledged it;
//! messages are delivered only for confirmed channels or patterns.

use crate::error::{ErrorClass, ErrorOrigin, InternalError};
use std::collections::BTreeMap;
use thiserror::Error as ThisError;

///
/// PubSubError
///

#[derive(Debug, ThisError)]
pub enum PubSubError {
    #[error("server confirmed {kind} '{name}' that was never requested")]
    UnexpectedConfirmation { kind: SubscriptionKind, name: String },

    #[error("message for {kind} '{name}' without a confirmed subscription")]
    NotSubscribed { kind: SubscriptionKind, name: String },
}

impl From<PubSubError> for InternalError {
    fn from(err: PubSubError) -> Self {
        Self::classified(ErrorClass::InvalidState, ErrorOrigin::PubSub, err.to_string())
    }
}

///
/// SubscriptionKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Channel => "channel",
            Self::Pattern => "pattern",
        })
    }
}

///
/// SubscriptionState
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionState {
    /// Requested, awaiting the server's acknowledgement.
    Pending,
    Confirmed,
    /// Unsubscribe requested; messages still arrive until confirmed.
    Leaving,
}

///
/// PubSubRequest
/// Command to send. An empty unsubscribe list means "all".
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PubSubRequest {
    Subscribe(Vec<String>),
    PSubscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    PUnsubscribe(Vec<String>),
}

///
/// PubSubResponse
/// One server push. `count` is the server's total subscription count.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PubSubResponse {
    Subscribe { channel: String, count: usize },
    PSubscribe { pattern: String, count: usize },
    Unsubscribe { channel: String, count: usize },
    PUnsubscribe { pattern: String, count: usize },
    Message { channel: String, payload: String },
    PMessage {
        pattern: String,
        channel: String,
        payload: String,
    },
}

///
/// Message
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: String,
}

///
/// Subscriber
///

#[derive(Clone, Debug, Default)]
pub struct Subscriber {
    channels: BTreeMap<String, SubscriptionState>,
    patterns: BTreeMap<String, SubscriptionState>,
    server_count: usize,
}

impl Subscriber {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request channels not already tracked. `None` when nothing is new.
    pub fn subscribe<S: Into<String>>(
        &mut self,
        channels: impl IntoIterator<Item = S>,
    ) -> Option<PubSubRequest> {
        Self::request(&mut self.channels, channels).map(PubSubRequest::Subscribe)
    }

    pub fn psubscribe<S: Into<String>>(
        &mut self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Option<PubSubRequest> {
        Self::request(&mut self.patterns, patterns).map(PubSubRequest::PSubscribe)
    }

    /// Leave `channels`, or every channel when empty.
    pub fn unsubscribe<S: Into<String>>(
        &mut self,
        channels: impl IntoIterator<Item = S>,
    ) -> PubSubRequest {
        PubSubRequest::Unsubscribe(Self::leave(&mut self.channels, channels))
    }

    pub fn punsubscribe<S: Into<String>>(
        &mut self,
        patterns: impl IntoIterator<Item = S>,
    ) -> PubSubRequest {
        PubSubRequest::PUnsubscribe(Self::leave(&mut self.patterns, patterns))
    }

    /// Advance state from one server push; returns a delivered message.
    pub fn handle(&mut self, response: PubSubResponse) -> Result<Option<Message>, PubSubError> {
        match response {
            PubSubResponse::Subscribe { channel, count } => {
                Self::confirm(&mut self.channels, SubscriptionKind::Channel, channel)?;
                self.server_count = count;
                Ok(None)
            }
            PubSubResponse::PSubscribe { pattern, count } => {
                Self::confirm(&mut self.patterns, SubscriptionKind::Pattern, pattern)?;
                self.server_count = count;
                Ok(None)
            }
            PubSubResponse::Unsubscribe { channel, count } => {
                self.channels.remove(&channel);
                self.server_count = count;
                tracing::debug!(%channel, count, "channel unsubscribed");
                Ok(None)
            }
            PubSubResponse::PUnsubscribe { pattern, count } => {
                self.patterns.remove(&pattern);
                self.server_count = count;
                tracing::debug!(%pattern, count, "pattern unsubscribed");
                Ok(None)
            }
            PubSubResponse::Message { channel, payload } => {
                Self::ensure_receiving(&self.channels, SubscriptionKind::Channel, &channel)?;
                Ok(Some(Message {
                    channel,
                    pattern: None,
                    payload,
                }))
            }
            PubSubResponse::PMessage {
                pattern,
                channel,
                payload,
            } => {
                Self::ensure_receiving(&self.patterns, SubscriptionKind::Pattern, &pattern)?;
                Ok(Some(Message {
                    channel,
                    pattern: Some(pattern),
                    payload,
                }))
            }
        }
    }

    #[must_use]
    pub fn channel_state(&self, channel: &str) -> Option<SubscriptionState> {
        self.channels.get(channel).copied()
    }

    #[must_use]
    pub fn pattern_state(&self, pattern: &str) -> Option<SubscriptionState> {
        self.patterns.get(pattern).copied()
    }

    /// Channels and patterns awaiting any acknowledgement.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.channels
            .values()
            .chain(self.patterns.values())
            .filter(|state| !matches!(state, SubscriptionState::Confirmed))
            .count()
    }

    /// Subscription count last reported by the server.
    #[must_use]
    pub const fn server_count(&self) -> usize {
        self.server_count
    }

    /// No tracked subscriptions remain; the connection may leave pub/sub mode.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn request<S: Into<String>>(
        tracked: &mut BTreeMap<String, SubscriptionState>,
        names: impl IntoIterator<Item = S>,
    ) -> Option<Vec<String>> {
        let mut requested = Vec::new();
        for name in names {
            let name = name.into();
            match tracked.get(&name) {
                Some(SubscriptionState::Pending | SubscriptionState::Confirmed) => {}
                Some(SubscriptionState::Leaving) | None => {
                    tracked.insert(name.clone(), SubscriptionState::Pending);
                    requested.push(name);
                }
            }
        }

        (!requested.is_empty()).then_some(requested)
    }

    fn leave<S: Into<String>>(
        tracked: &mut BTreeMap<String, SubscriptionState>,
        names: impl IntoIterator<Item = S>,
    ) -> Vec<String> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            for state in tracked.values_mut() {
                *state = SubscriptionState::Leaving;
            }
            return names;
        }

        for name in &names {
            if let Some(state) = tracked.get_mut(name) {
                *state = SubscriptionState::Leaving;
            }
        }
        names
    }

    fn confirm(
        tracked: &mut BTreeMap<String, SubscriptionState>,
        kind: SubscriptionKind,
        name: String,
    ) -> Result<(), PubSubError> {
        let Some(state) = tracked.get_mut(&name) else {
            return Err(PubSubError::UnexpectedConfirmation { kind, name });
        };
        // a confirmation racing a later unsubscribe keeps the leave intent
        if matches!(state, SubscriptionState::Pending) {
            *state = SubscriptionState::Confirmed;
        }
        tracing::debug!(%kind, %name, "subscription confirmed");

        Ok(())
    }

    fn ensure_receiving(
        tracked: &BTreeMap<String, SubscriptionState>,
        kind: SubscriptionKind,
        name: &str,
    ) -> Result<(), PubSubError> {
        match tracked.get(name) {
            Some(SubscriptionState::Confirmed | SubscriptionState::Leaving) => Ok(()),
            Some(SubscriptionState::Pending) | None => Err(PubSubError::NotSubscribed {
                kind,
                name: name.to_string(),
            }),
        }
    }
}
