//! Authors and IRC nick derivation.
//!
//! Every remote account that shows up in the timeline is exposed to IRC
//! clients as a channel participant. The nick is derived from the display
//! name (or the handle when there is none) and is a pure function of those
//! two fields.

use serde::{Deserialize, Serialize};

/// Longest nick we hand out.
pub const MAX_NICK_LEN: usize = 16;

/// Handle suffix that carries no information on the default PDS.
const DEFAULT_HANDLE_SUFFIX: &str = ".bsky.social";

/// Nick used when nothing usable survives sanitizing.
const FALLBACK_NICK: &str = "_nohandle";

/// A timeline account, normalized from the upstream profile view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    pub did: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub nick: String,
}

impl Author {
    pub fn new(
        did: impl Into<String>,
        handle: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        let handle = handle.into();
        // Upstream sends "" for accounts that never set a display name
        let display_name = display_name.filter(|name| !name.is_empty());
        let nick = derive_nick(&handle, display_name.as_deref());
        Self {
            did: did.into(),
            handle,
            display_name,
            nick,
        }
    }

    /// Display name if set, otherwise the handle. Used as the IRC realname.
    pub fn real_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.handle)
    }
}

/// Derive an IRC nick from a handle and optional display name.
///
/// The result is non-empty, at most [`MAX_NICK_LEN`] characters, only
/// contains `[A-Za-z0-9_]` and never starts with a digit.
pub fn derive_nick(handle: &str, display_name: Option<&str>) -> String {
    let source = display_name.filter(|name| !name.is_empty()).unwrap_or(handle);
    sanitize_nick(source)
}

/// Turn an arbitrary string into a valid nick.
pub fn sanitize_nick(field: &str) -> String {
    let field = field.strip_suffix(DEFAULT_HANDLE_SUFFIX).unwrap_or(field);

    let mut nick: String = field
        .chars()
        .map(|c| if c == '.' || c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    if nick.is_empty() {
        nick.push_str(FALLBACK_NICK);
    }
    if nick.starts_with(|c: char| c.is_ascii_digit()) {
        nick.insert(0, '_');
    }
    // Only ASCII survives the filter, so byte truncation is char-safe
    nick.truncate(MAX_NICK_LEN);
    nick
}
