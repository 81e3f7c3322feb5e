//! Participant identity and the bootstrap tokens it is built from.
//!
//! Two long-lived tokens are issued at page load: a stable identity token and
//! a generated display name. A channel presenting both is turned into an
//! [`Identity`]; a channel missing either never reaches a room.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Query / cookie name of the stable identity token.
pub const IDENT_TOKEN: &str = "ident";
/// Query / cookie name of the display name token.
pub const NAME_TOKEN: &str = "name";

/// Everything but RFC 3986 unreserved characters gets escaped.
const TOKEN_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Stable per-participant credential, surviving reconnects.
///
/// Never sent to other participants; rooms expose a pseudonym instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh identity token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StableId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StableId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A connected participant's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub stable_id: StableId,
    pub display_name: String,
}

impl Identity {
    pub fn new(stable_id: impl Into<StableId>, display_name: impl Into<String>) -> Self {
        Self {
            stable_id: stable_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// The two identity tokens a channel must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTokens {
    pub ident: String,
    pub name: String,
}

impl IdentityTokens {
    /// Fresh tokens, as the page-load collaborator would issue them.
    pub fn generate() -> Self {
        Self {
            ident: StableId::generate().to_string(),
            name: generate_display_name(),
        }
    }

    /// Extract tokens from an upgrade request's query string and `Cookie`
    /// header. Query parameters win over cookies. Values are percent-decoded,
    /// and `+` means a space in the query string.
    ///
    /// Returns `None` unless both tokens are present and non-empty.
    pub fn from_request_parts(query: Option<&str>, cookie: Option<&str>) -> Option<Self> {
        let mut ident = None;
        let mut name = None;

        let cookie_pairs = cookie
            .into_iter()
            .flat_map(|header| header.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(key, value)| (key, decode_value(value)));
        let query_pairs = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter_map(|pair| pair.split_once('='))
            .map(|(key, value)| (key, decode_value(&value.replace('+', " "))));

        // Later pairs overwrite earlier ones, so cookies go first.
        for (key, value) in cookie_pairs.chain(query_pairs) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                IDENT_TOKEN => ident = Some(value.to_string()),
                NAME_TOKEN => name = Some(value.to_string()),
                _ => {}
            }
        }

        Some(Self {
            ident: ident?,
            name: name?,
        })
    }

    /// Percent-encoded query string carrying these tokens, for client
    /// connections.
    pub fn to_query(&self) -> String {
        format!(
            "{IDENT_TOKEN}={}&{NAME_TOKEN}={}",
            utf8_percent_encode(&self.ident, TOKEN_VALUE),
            utf8_percent_encode(&self.name, TOKEN_VALUE)
        )
    }

    pub fn into_identity(self) -> Identity {
        Identity::new(StableId::new(self.ident), self.name)
    }
}

fn decode_value(raw: &str) -> String {
    percent_decode_str(raw.trim()).decode_utf8_lossy().into_owned()
}

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "eager", "fancy", "gentle", "happy", "jolly", "kind",
    "lively", "merry", "nimble", "proud", "quick", "silly", "witty", "zesty",
];

const COLORS: &[&str] = &[
    "amber", "azure", "black", "blue", "coral", "crimson", "cyan", "gold",
    "green", "indigo", "ivory", "lime", "olive", "orange", "violet", "white",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "falcon", "ferret", "gecko", "heron", "koala", "lemur",
    "lynx", "otter", "panda", "puffin", "rabbit", "raven", "tiger", "walrus",
];

/// Generate an adjective-color-animal display name.
pub fn generate_display_name() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    let pick = |words: &[&'static str], byte: u8| words[byte as usize % words.len()];
    format!(
        "{}-{}-{}",
        pick(ADJECTIVES, bytes[0]),
        pick(COLORS, bytes[1]),
        pick(ANIMALS, bytes[2])
    )
}

/// Normalize a requested room key: lower-cased, non-alphanumerics stripped.
pub fn normalize_room_key(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}
