use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChannelId);
id_newtype!(UserId);
id_newtype!(CallbackTarget);

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Ordered message cursor.
///
/// Slack identifies messages by `ts` strings of the form `"1716572940.000123"`.
/// The cursor keeps them as microseconds since the Unix epoch so positions
/// compare numerically regardless of how many fractional digits the raw
/// string carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(i64);

impl Position {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let seconds = parts.next()?.parse::<i64>().ok()?;
        let micros_raw = parts.next().unwrap_or("0");
        if parts.next().is_some() || !micros_raw.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let micros_digits = micros_raw.chars().take(6).collect::<String>();
        let micros_padded = format!("{micros_digits:0<6}");
        let micros = micros_padded.parse::<i64>().ok()?;
        seconds
            .checked_mul(MICROS_PER_SECOND)?
            .checked_add(micros)
            .map(Self)
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_micros())
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.0)
    }

    /// Render as a Slack `ts` string with six fractional digits.
    pub fn to_slack_ts(self) -> String {
        let seconds = self.0.div_euclid(MICROS_PER_SECOND);
        let micros = self.0.rem_euclid(MICROS_PER_SECOND);
        format!("{seconds}.{micros:06}")
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_slack_ts())
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid message position: {s:?}"))
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_slack_ts())
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    /// Join/leave/topic notices and other platform-generated entries.
    pub system: bool,
    pub bot: bool,
    pub thread_reply: bool,
}

/// A channel message as fetched. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: Option<UserId>,
    pub text: String,
    pub position: Position,
    #[serde(default)]
    pub flags: MessageFlags,
}

/// History for one window, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBatch {
    pub messages: Vec<Message>,
    /// The source stopped before reaching the window start; the oldest messages are missing.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: ChannelId,
    pub name: String,
}

impl ChannelRef {
    pub fn new(id: impl Into<ChannelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// `#name` for display, falling back to the id when the name is unknown.
    pub fn label(&self) -> String {
        if self.name.trim().is_empty() {
            format!("#{}", self.id)
        } else {
            format!("#{}", self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchWindow {
    /// Exclusive lower bound.
    pub oldest: Option<Position>,
    /// Inclusive upper bound.
    pub latest: Option<Position>,
}

impl FetchWindow {
    pub fn contains(&self, position: Position) -> bool {
        self.oldest.is_none_or(|oldest| position > oldest)
            && self.latest.is_none_or(|latest| position <= latest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Only the requester sees the report.
    Private,
    /// Everyone in the channel sees the report.
    Broadcast,
}

impl Visibility {
    pub fn slack_response_type(self) -> &'static str {
        match self {
            Self::Private => "ephemeral",
            Self::Broadcast => "in_channel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundReport {
    pub text: String,
    #[serde(default)]
    pub blocks: Vec<serde_json::Value>,
    pub visibility: Visibility,
    /// Replace the acknowledgment in place where the transport supports it.
    pub replace_original: bool,
}
