//! The closed set of supported conferencing platforms.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    GoogleMeet,
    Zoom,
    Teams,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoogleMeet => "google_meet",
            Self::Zoom => "zoom",
            Self::Teams => "teams",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "google_meet" => Some(Self::GoogleMeet),
            "zoom" => Some(Self::Zoom),
            "teams" => Some(Self::Teams),
            _ => None,
        }
    }

    /// Build the join URL for a platform-assigned meeting id. Returns `None`
    /// when the id cannot possibly address a meeting on this platform.
    pub fn construct_meeting_url(self, native_meeting_id: &str) -> Option<String> {
        if native_meeting_id.is_empty() || native_meeting_id.contains(char::is_whitespace) {
            return None;
        }
        match self {
            Self::GoogleMeet => {
                // Meet codes look like xxx-xxxx-xxx.
                let ok = native_meeting_id.len() <= 32
                    && native_meeting_id
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c == '-');
                ok.then(|| format!("https://meet.google.com/{}", native_meeting_id))
            }
            Self::Zoom => {
                let ok = native_meeting_id.chars().all(|c| c.is_ascii_alphanumeric());
                ok.then(|| format!("https://zoom.us/j/{}", native_meeting_id))
            }
            Self::Teams => {
                let ok = native_meeting_id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '%' | '.'));
                ok.then(|| {
                    format!(
                        "https://teams.microsoft.com/l/meetup-join/{}",
                        native_meeting_id
                    )
                })
            }
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
