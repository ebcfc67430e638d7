use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::Tags;

/// Priority of an [`Event`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// The default priority.
    #[default]
    Normal,
    /// Low priority.
    Low,
}

impl std::str::FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(()),
        }
    }
}

/// Alert type of an [`Event`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    /// The default alert type.
    #[default]
    Info,
    /// A warning.
    Warning,
    /// An error.
    Error,
    /// A success notification.
    Success,
}

impl AlertType {
    /// Returns the wire name of the alert type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "success" => Ok(Self::Success),
            _ => Err(()),
        }
    }
}

/// A discrete occurrence submitted with the `_e{...}` syntax.
///
/// Events are buffered by the aggregator and forwarded to backends as-is. They are never
/// combined with each other.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Event {
    /// Title of the event.
    pub title: String,
    /// Body of the event. Escaped `\n` sequences are decoded to newlines.
    pub text: String,
    /// Unix timestamp in seconds, if submitted by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Host the event relates to. Defaults to the source of the packet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Event priority.
    #[serde(default)]
    pub priority: Priority,
    /// Event alert type.
    #[serde(default)]
    pub alert_type: AlertType,
    /// Key used to group related events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_key: Option<String>,
    /// Name of the system that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type_name: Option<String>,
    /// Tags of the event merged with the configured default tags.
    #[serde(default)]
    pub tags: Tags,
    /// Address of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Event {
    /// Creates an event with default attributes.
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            timestamp: None,
            hostname: None,
            priority: Priority::default(),
            alert_type: AlertType::default(),
            aggregation_key: None,
            source_type_name: None,
            tags: Tags::new(),
            source: None,
        }
    }
}
