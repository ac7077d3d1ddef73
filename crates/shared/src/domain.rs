use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server part of an individual user's chat identifier.
pub const DIRECT_SERVER: &str = "s.whatsapp.net";
/// Server part of a group chat identifier.
pub const GROUP_SERVER: &str = "g.us";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(ChatId);
id_newtype!(MessageId);
id_newtype!(ContactId);

impl ChatId {
    /// Builds the direct chat identifier for a bare phone number.
    pub fn direct(phone_number: &str) -> Self {
        Self(format!("{phone_number}@{DIRECT_SERVER}"))
    }

    pub fn kind(&self) -> ChatKind {
        if self.server() == Some(GROUP_SERVER) {
            ChatKind::Group
        } else {
            ChatKind::Direct
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind() == ChatKind::Group
    }

    pub fn user_part(&self) -> &str {
        user_part(&self.0)
    }

    pub fn server(&self) -> Option<&str> {
        self.0.split_once('@').map(|(_, server)| server)
    }
}

impl ContactId {
    pub fn phone_number(&self) -> &str {
        user_part(&self.0)
    }
}

/// Everything before the `@` of an address-like identifier, ignoring a device suffix.
pub fn user_part(identifier: &str) -> &str {
    let user = identifier.split('@').next().unwrap_or(identifier);
    user.split(':').next().unwrap_or(user)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Direct,
    Group,
}

string_enum!(ChatKind, "chat kind", { Direct => "direct", Group => "group" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

string_enum!(Direction, "direction", { Inbound => "inbound", Outbound => "outbound" });

impl Direction {
    pub fn from_me(from_me: bool) -> Self {
        if from_me {
            Self::Outbound
        } else {
            Self::Inbound
        }
    }

    pub fn is_from_me(self) -> bool {
        self == Self::Outbound
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    System,
}

string_enum!(ContentKind, "content kind", {
    Text => "text",
    Image => "image",
    Video => "video",
    Audio => "audio",
    Document => "document",
    System => "system",
});

impl ContentKind {
    pub fn is_media(self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Document
        )
    }

    pub fn from_mime(mime_type: &str) -> Self {
        let top_level = mime_type.split('/').next().unwrap_or_default();
        match top_level {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Document,
        }
    }
}

/// Outbound delivery progress. Ordered so that a status only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Played,
}

string_enum!(DeliveryStatus, "delivery status", {
    Pending => "pending",
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
    Played => "played",
});

impl DeliveryStatus {
    pub fn rank(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Played => 4,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Self::Pending,
            1 => Self::Sent,
            2 => Self::Delivered,
            3 => Self::Read,
            _ => Self::Played,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_chats_are_detected_by_server_part() {
        assert!(ChatId::from("120363025@g.us").is_group());
        assert_eq!(ChatId::from("15551234@s.whatsapp.net").kind(), ChatKind::Direct);
        assert_eq!(ChatId::direct("15551234").as_str(), "15551234@s.whatsapp.net");
    }

    #[test]
    fn user_part_drops_server_and_device_suffix() {
        assert_eq!(user_part("15551234:7@s.whatsapp.net"), "15551234");
        assert_eq!(ContactId::from("15551234").phone_number(), "15551234");
    }

    #[test]
    fn delivery_status_ranks_round_trip_and_order() {
        assert!(DeliveryStatus::Read > DeliveryStatus::Delivered);
        assert_eq!(DeliveryStatus::from_rank(DeliveryStatus::Read.rank()), DeliveryStatus::Read);
        assert_eq!("played".parse::<DeliveryStatus>(), Ok(DeliveryStatus::Played));
        assert!("bogus".parse::<ContentKind>().is_err());
    }

    #[test]
    fn content_kind_follows_mime_top_level_type() {
        assert_eq!(ContentKind::from_mime("audio/ogg; codecs=opus"), ContentKind::Audio);
        assert_eq!(ContentKind::from_mime("application/pdf"), ContentKind::Document);
        assert!(!ContentKind::System.is_media());
    }
}
