use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An account allowed to log in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// PBKDF2-HMAC-SHA256 derived key
    pub hash: Vec<u8>,
    pub salt: Vec<u8>,
    #[serde(default)]
    pub privileged: bool,
}

/// A browser session keyed by its cookie value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub privileged: bool,
    pub last_seen: DateTime<Utc>,
}

/// Target of a share link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Virtual path of the shared file or directory
    pub location: String,
    /// Force a download instead of inline display
    #[serde(default)]
    pub attachment: bool,
}
