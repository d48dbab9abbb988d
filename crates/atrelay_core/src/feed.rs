//! Normalized timeline entries.
//!
//! These types are the closed shape the rest of the bridge works with. The
//! loosely typed lexicon payloads are converted into them once, in
//! [`crate::upstream::normalize`], and nothing downstream inspects `$type`
//! tags again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::author::Author;

/// One timeline entry: a post, possibly wrapped in a repost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub post: Post,
    pub reason: Option<RepostReason>,
}

/// Why a post appears in the timeline when its author isn't followed directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepostReason {
    pub by: Author,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub cid: String,
    pub uri: String,
    pub author: Author,
    pub created_at: DateTime<Utc>,
    pub text: String,
    /// Link targets from `#link` facets, in facet order
    pub facets: Vec<String>,
    pub embed: Option<Embed>,
    /// Set when the post replies to another post
    pub reply: Option<ReplyMarker>,
}

/// Marks a post as part of a reply thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMarker {
    pub parent_uri: String,
}

/// Rich content attached to a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Embed {
    ImageSet { items: Vec<ImageRef> },
    Video {
        alt: Option<String>,
        cid: String,
        did: Option<String>,
    },
    External { uri: String },
    QuotedPost(Box<QuotedPost>),
    /// A quote that also carries its own media
    QuoteWithMedia {
        quote: Box<QuotedPost>,
        media: Box<Embed>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub alt: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotedPost {
    pub uri: String,
    pub author: Author,
    pub text: String,
    pub facets: Vec<String>,
    pub embed: Option<Embed>,
}

impl FeedItem {
    pub fn original(post: Post) -> Self {
        Self { post, reason: None }
    }

    pub fn repost(post: Post, by: Author, indexed_at: DateTime<Utc>) -> Self {
        Self {
            post,
            reason: Some(RepostReason { by, indexed_at }),
        }
    }

    pub fn is_repost(&self) -> bool {
        self.reason.is_some()
    }

    /// When this entry entered the timeline: repost time for reposts,
    /// otherwise the post's own creation time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.reason
            .as_ref()
            .map(|reason| reason.indexed_at)
            .unwrap_or(self.post.created_at)
    }

    /// Stable identity of this timeline entry. A repost of a post is a
    /// different entry than the post itself or another account's repost.
    pub fn key(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{}#repost:{}", self.post.uri, reason.by.did),
            None => self.post.uri.clone(),
        }
    }
}

/// The account an entry is attributed to in the channel: the reposting
/// actor for reposts, otherwise the post's author.
pub fn extract_author(item: &FeedItem) -> Author {
    match &item.reason {
        Some(reason) => reason.by.clone(),
        None => item.post.author.clone(),
    }
}
