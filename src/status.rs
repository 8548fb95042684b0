use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Presence states a link-local peer can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Offline,
    Online,
    DoNotDisturb,
    Invisible,
}

impl PresenceStatus {
    pub fn is_online(self) -> bool {
        self != PresenceStatus::Offline
    }

    /// Value announced in the `status` TXT property.
    pub fn txt_token(self) -> &'static str {
        match self {
            PresenceStatus::Offline => "offline",
            PresenceStatus::Online => "avail",
            PresenceStatus::DoNotDisturb => "dnd",
            PresenceStatus::Invisible => "invisible",
        }
    }

    /// Parses a `status` TXT value. Unknown tokens yield `None`; callers
    /// treat that as Online.
    pub fn from_txt(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "avail" | "available" | "online" => Some(PresenceStatus::Online),
            "dnd" | "away" | "do not disturb" => Some(PresenceStatus::DoNotDisturb),
            "invisible" => Some(PresenceStatus::Invisible),
            "offline" => Some(PresenceStatus::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresenceStatus::Offline => "Offline",
            PresenceStatus::Online => "Online",
            PresenceStatus::DoNotDisturb => "Do Not Disturb",
            PresenceStatus::Invisible => "Invisible",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown presence status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for PresenceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PresenceStatus::from_txt(s).ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
