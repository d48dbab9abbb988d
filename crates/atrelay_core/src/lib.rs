//! atrelay core - timeline model and feed store
//!
//! Everything the IRC side needs to know about the social network: the
//! normalized feed model, nick derivation for authors, the text renderer
//! that turns a post into chat lines, and the shared feed store that keeps
//! a numbered snapshot of the home timeline.

pub mod author;
pub mod config;
pub mod error;
pub mod feed;
pub mod render;
pub mod store;
pub mod upstream;

pub use author::Author;
pub use config::BridgeConfig;
pub use error::{CoreError, Result};
pub use feed::{extract_author, Embed, FeedItem, Post};
pub use render::{render, RenderedPost};
pub use store::{FeedSnapshot, FeedStore};
pub use upstream::{BlueskyClient, Credentials, FeedSource, InMemoryFeedSource, Profile};
