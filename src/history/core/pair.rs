//! Message pair model: one user/assistant exchange.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::history::core::ids::{PairId, TopicId};

/// Highest star rating a pair can carry.
pub const MAX_STAR: u8 = 3;

/// Color marker used to tag pairs.
///
/// Replaces the old boolean "include in context" flag: `Blue` pairs are
/// included in the model context, `Grey` pairs are not.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFlag {
    /// Included in context.
    #[default]
    Blue,
    /// Excluded from context.
    Grey,
}

impl ColorFlag {
    /// Map the legacy include flag onto a color.
    #[must_use]
    pub const fn from_included(included: bool) -> Self {
        if included { Self::Blue } else { Self::Grey }
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Grey => "grey",
        }
    }
}

impl fmt::Display for ColorFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request status of a pair.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Not in flight.
    #[default]
    Idle,
    /// Request sent, waiting for the reply.
    Sending,
    /// Request failed; see `error_message`.
    Error,
    /// Reply received.
    Complete,
}

impl LifecycleState {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user/assistant exchange.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePair {
    /// Unique identifier.
    pub id: PairId,
    /// Creation time in milliseconds since Unix epoch.
    pub created_at: i64,
    /// Owning topic.
    pub topic_id: TopicId,
    /// Model used for the exchange.
    pub model: String,
    /// Rating in `0..=MAX_STAR`.
    pub star: u8,
    /// Color marker.
    pub color_flag: ColorFlag,
    /// User message body.
    pub user_text: String,
    /// Assistant reply body.
    pub assistant_text: String,
    /// In-flight request status.
    pub lifecycle_state: LifecycleState,
    /// Failure description, only set in the `Error` state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Cached token estimate maintained by an outside collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_length: Option<u32>,
}

/// Fields supplied when creating a pair.
#[derive(Clone, Debug, Default)]
pub struct NewPair {
    /// Owning topic.
    pub topic_id: TopicId,
    /// Model identifier.
    pub model: String,
    /// User message body.
    pub user_text: String,
    /// Assistant reply body.
    pub assistant_text: String,
}

impl NewPair {
    /// Build a new pair request.
    #[must_use]
    pub fn new(
        topic_id: TopicId,
        model: impl Into<String>,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
    ) -> Self {
        Self {
            topic_id,
            model: model.into(),
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
        }
    }

    /// Materialize the pair with default rating, color and state.
    #[must_use]
    pub fn into_pair(self) -> MessagePair {
        MessagePair {
            id: PairId::new(),
            created_at: Utc::now().timestamp_millis(),
            topic_id: self.topic_id,
            model: self.model,
            star: 0,
            color_flag: ColorFlag::default(),
            user_text: self.user_text,
            assistant_text: self.assistant_text,
            lifecycle_state: LifecycleState::Idle,
            error_message: None,
            token_length: None,
        }
    }
}

/// Partial update of a pair. Fields left `None` are untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PairPatch {
    /// New owning topic.
    pub topic_id: Option<TopicId>,
    /// New model identifier.
    pub model: Option<String>,
    /// New rating, clamped to `MAX_STAR`.
    pub star: Option<u8>,
    /// New color marker.
    pub color_flag: Option<ColorFlag>,
    /// New user text.
    pub user_text: Option<String>,
    /// New assistant text.
    pub assistant_text: Option<String>,
    /// New request status.
    pub lifecycle_state: Option<LifecycleState>,
    /// New error message (`Some(None)` clears it).
    pub error_message: Option<Option<String>>,
    /// New token estimate (`Some(None)` clears it).
    pub token_length: Option<Option<u32>>,
}

impl PairPatch {
    /// Create an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the pair to another topic.
    #[must_use]
    pub const fn with_topic(mut self, topic_id: TopicId) -> Self {
        self.topic_id = Some(topic_id);
        self
    }

    /// Set the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the rating.
    #[must_use]
    pub const fn with_star(mut self, star: u8) -> Self {
        self.star = Some(star);
        self
    }

    /// Set the color marker.
    #[must_use]
    pub const fn with_color(mut self, color: ColorFlag) -> Self {
        self.color_flag = Some(color);
        self
    }

    /// Set the user text.
    #[must_use]
    pub fn with_user_text(mut self, text: impl Into<String>) -> Self {
        self.user_text = Some(text.into());
        self
    }

    /// Set the assistant text.
    #[must_use]
    pub fn with_assistant_text(mut self, text: impl Into<String>) -> Self {
        self.assistant_text = Some(text.into());
        self
    }

    /// Set the request status.
    #[must_use]
    pub const fn with_state(mut self, state: LifecycleState) -> Self {
        self.lifecycle_state = Some(state);
        self
    }

    /// Mark the pair failed with a message.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.lifecycle_state = Some(LifecycleState::Error);
        self.error_message = Some(Some(message.into()));
        self
    }

    /// Set or clear the token estimate.
    #[must_use]
    pub const fn with_token_length(mut self, token_length: Option<u32>) -> Self {
        self.token_length = Some(token_length);
        self
    }

    /// Shallow-merge this patch into `pair`.
    ///
    /// The rating is clamped to `MAX_STAR` and `error_message` is dropped
    /// whenever the resulting state is not `Error`.
    pub fn apply_to(&self, pair: &mut MessagePair) {
        if let Some(topic_id) = self.topic_id {
            pair.topic_id = topic_id;
        }
        if let Some(model) = &self.model {
            pair.model.clone_from(model);
        }
        if let Some(star) = self.star {
            pair.star = star.min(MAX_STAR);
        }
        if let Some(color) = self.color_flag {
            pair.color_flag = color;
        }
        if let Some(text) = &self.user_text {
            pair.user_text.clone_from(text);
        }
        if let Some(text) = &self.assistant_text {
            pair.assistant_text.clone_from(text);
        }
        if let Some(state) = self.lifecycle_state {
            pair.lifecycle_state = state;
        }
        if let Some(message) = &self.error_message {
            pair.error_message.clone_from(message);
        }
        if let Some(token_length) = self.token_length {
            pair.token_length = token_length;
        }

        if pair.lifecycle_state != LifecycleState::Error {
            pair.error_message = None;
        }
    }
}
