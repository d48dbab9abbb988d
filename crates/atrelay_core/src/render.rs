//! Post rendering for a line-oriented chat surface.
//!
//! Rendering is a pure transformation from a [`FeedItem`] to the ordered
//! lines a client sees. Nesting (reposts, quotes) is expressed with a marker
//! line followed by body lines carrying [`INDENT`].

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::author::Author;
use crate::feed::{extract_author, Embed, FeedItem, ImageRef, QuotedPost};

/// Prefix for lines nested under a repost or quote marker.
pub const INDENT: &str = " | ";

/// Placeholder for posts without any text.
pub const NO_TEXT: &str = "(no text)";

/// Blob viewer used for video playback links.
const VIDEO_PLAYER_BASE: &str = "https://atproto-browser.vercel.app/blob";

static ACTOR_DID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"did:(?:plc|web):[^/]+").expect("valid DID regex"));

/// A feed item rendered once, ready to be attributed to its author by each session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPost {
    /// Identity of the timeline entry, see [`FeedItem::key`]
    pub key: String,
    pub author: Author,
    pub at: DateTime<Utc>,
    pub lines: Vec<String>,
}

impl RenderedPost {
    pub fn from_item(item: &FeedItem) -> Self {
        Self {
            key: item.key(),
            author: extract_author(item),
            at: item.timestamp(),
            lines: render(item),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Render a timeline entry into display lines.
///
/// Replies render to nothing: their parent isn't fetched, so they'd read
/// out of context.
pub fn render(item: &FeedItem) -> Vec<String> {
    let post = &item.post;
    if post.reply.is_some() {
        return Vec::new();
    }

    let mut body = render_text(&post.text, &post.facets);
    body.extend(render_embed(post.embed.as_ref(), &post.uri));
    if body.len() == 2 {
        body = vec![body.join(" ")];
    }

    if item.is_repost() {
        let mut lines = Vec::with_capacity(body.len() + 1);
        lines.push(format!("↻ @{}:", post.author.handle));
        lines.extend(indent(body));
        lines
    } else {
        body
    }
}

/// Render an embed. `post_uri` is the URI of the post carrying it, used to
/// locate the owning actor for video links.
pub fn render_embed(embed: Option<&Embed>, post_uri: &str) -> Vec<String> {
    let Some(embed) = embed else {
        return Vec::new();
    };

    match embed {
        Embed::ImageSet { items } => items.iter().map(render_image).collect(),
        Embed::QuotedPost(quote) => render_quote(quote),
        Embed::External { uri } => vec![format!("🔗 {uri}")],
        Embed::Video { alt, cid, did } => {
            let actor = did
                .as_deref()
                .or_else(|| ACTOR_DID.find(post_uri).map(|m| m.as_str()));
            match actor {
                Some(actor) if !cid.is_empty() => {
                    let url = format!("{VIDEO_PLAYER_BASE}/{actor}/{cid}");
                    vec![format!("🎥 {}{url}", alt_prefix(alt.as_deref()))]
                }
                _ => Vec::new(),
            }
        }
        Embed::QuoteWithMedia { quote, media } => {
            let mut lines = render_embed(Some(media), post_uri);
            lines.extend(render_quote(quote));
            lines
        }
    }
}

/// Split post text into non-empty lines and append facet links to the last one.
fn render_text(text: &str, facets: &[String]) -> Vec<String> {
    let text = text.trim();
    let text = if text.is_empty() { NO_TEXT } else { text };

    let mut lines: Vec<String> = text
        .split(['\n', '\r'])
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();

    if !facets.is_empty() {
        let links = facets.join(" ");
        match lines.last_mut() {
            Some(last) => {
                last.push(' ');
                last.push_str(&links);
            }
            None => lines.push(links),
        }
    }
    lines
}

fn render_image(image: &ImageRef) -> String {
    format!("📷 {}{}", alt_prefix(image.alt.as_deref()), image.url)
}

fn render_quote(quote: &QuotedPost) -> Vec<String> {
    let mut body = render_text(&quote.text, &quote.facets);
    body.extend(render_embed(quote.embed.as_ref(), &quote.uri));

    let mut lines = Vec::with_capacity(body.len() + 1);
    lines.push(format!("💬 @{}:", quote.author.handle));
    lines.extend(indent(body));
    lines
}

/// Alt text flattened to one line, followed by a space; empty when absent.
fn alt_prefix(alt: Option<&str>) -> String {
    match alt.map(|a| a.replace(['\n', '\r'], " ")) {
        Some(alt) if !alt.trim().is_empty() => format!("{} ", alt.trim()),
        _ => String::new(),
    }
}

fn indent(lines: Vec<String>) -> impl Iterator<Item = String> {
    lines.into_iter().map(|line| format!("{INDENT}{line}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Post, ReplyMarker};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const URI: &str = "at://did:plc:alice123/app.bsky.feed.post/3kabc";

    fn alice() -> Author {
        Author::new("did:plc:alice123", "alice.bsky.social", Some("Alice".into()))
    }

    fn post(text: &str) -> Post {
        Post {
            cid: "bafypost".to_string(),
            uri: URI.to_string(),
            author: alice(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            text: text.to_string(),
            facets: Vec::new(),
            embed: None,
            reply: None,
        }
    }

    fn item(post: Post) -> FeedItem {
        FeedItem::original(post)
    }

    fn quote(text: &str, embed: Option<Embed>) -> QuotedPost {
        QuotedPost {
            uri: "at://did:plc:quoted9/app.bsky.feed.post/3kq".to_string(),
            author: Author::new("did:plc:quoted9", "q.example.com", None),
            text: text.to_string(),
            facets: Vec::new(),
            embed,
        }
    }

    #[test]
    fn test_text_with_facet_link() {
        let mut p = post("hello\nworld");
        p.facets = vec!["http://x".to_string()];
        assert_eq!(render(&item(p)), vec!["hello", "world http://x"]);
    }

    #[test]
    fn test_blank_lines_dropped() {
        let p = post("one\r\n\r\n  \ntwo\rthree");
        // three lines, so no compaction
        assert_eq!(render(&item(p)), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_empty_text_placeholder() {
        assert_eq!(render(&item(post("   "))), vec![NO_TEXT]);
    }

    #[test]
    fn test_reply_renders_nothing() {
        let mut p = post("a reply");
        p.reply = Some(ReplyMarker {
            parent_uri: "at://did:plc:x/app.bsky.feed.post/1".into(),
        });
        assert!(render(&item(p.clone())).is_empty());

        let bob = Author::new("did:plc:bob", "bob.bsky.social", None);
        let repost = FeedItem::repost(p, bob, Utc::now());
        assert!(render(&repost).is_empty());
    }

    #[test]
    fn test_single_image_line() {
        let embed = Embed::ImageSet {
            items: vec![ImageRef {
                alt: Some("cat".into()),
                url: "http://img".into(),
            }],
        };
        let lines = render_embed(Some(&embed), URI);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("cat"));
        assert!(lines[0].contains("http://img"));
        assert_eq!(lines[0], "📷 cat http://img");
    }

    #[test]
    fn test_image_alt_flattened() {
        let embed = Embed::ImageSet {
            items: vec![
                ImageRef {
                    alt: Some("a\nmultiline alt\n".into()),
                    url: "http://img/1".into(),
                },
                ImageRef {
                    alt: None,
                    url: "http://img/2".into(),
                },
            ],
        };
        assert_eq!(
            render_embed(Some(&embed), URI),
            vec!["📷 a multiline alt http://img/1", "📷 http://img/2"]
        );
    }

    #[test]
    fn test_two_lines_compacted() {
        let mut p = post("look at this");
        p.embed = Some(Embed::External {
            uri: "https://example.com".into(),
        });
        assert_eq!(render(&item(p)), vec!["look at this 🔗 https://example.com"]);
    }

    #[test]
    fn test_video_url_from_post_uri() {
        let embed = Embed::Video {
            alt: Some("clip".into()),
            cid: "bafyvid".into(),
            did: None,
        };
        assert_eq!(
            render_embed(Some(&embed), URI),
            vec!["🎥 clip https://atproto-browser.vercel.app/blob/did:plc:alice123/bafyvid"]
        );
    }

    #[test]
    fn test_video_without_actor_renders_nothing() {
        let embed = Embed::Video {
            alt: None,
            cid: "bafyvid".into(),
            did: None,
        };
        assert!(render_embed(Some(&embed), "https://not-an-at-uri").is_empty());
    }

    #[test]
    fn test_quote_recurses_into_nested_embed() {
        let nested = Embed::ImageSet {
            items: vec![ImageRef {
                alt: None,
                url: "http://img/q".into(),
            }],
        };
        let mut p = post("so true");
        p.embed = Some(Embed::QuotedPost(Box::new(quote("line a\nline b", Some(nested)))));
        assert_eq!(
            render(&item(p)),
            vec![
                "so true",
                "💬 @q.example.com:",
                " | line a",
                " | line b",
                " | 📷 http://img/q",
            ]
        );
    }

    #[test]
    fn test_quoted_video_uses_quoted_uri() {
        let video = Embed::Video {
            alt: None,
            cid: "bafyq".into(),
            did: None,
        };
        let embed = Embed::QuotedPost(Box::new(quote("watch", Some(video))));
        let lines = render_embed(Some(&embed), URI);
        assert_eq!(
            lines[2],
            " | 🎥 https://atproto-browser.vercel.app/blob/did:plc:quoted9/bafyq"
        );
    }

    #[test]
    fn test_quote_with_media_order() {
        let embed = Embed::QuoteWithMedia {
            quote: Box::new(quote("quoted", None)),
            media: Box::new(Embed::External {
                uri: "https://example.com".into(),
            }),
        };
        assert_eq!(
            render_embed(Some(&embed), URI),
            vec!["🔗 https://example.com", "💬 @q.example.com:", " | quoted"]
        );
    }

    #[test]
    fn test_repost_wraps_body() {
        let mut p = post("first\nsecond\nthird");
        p.facets = vec!["https://a.example".into()];
        let plain = render(&item(p.clone()));

        let bob = Author::new("did:plc:bob", "bob.bsky.social", None);
        let lines = render(&FeedItem::repost(p, bob, Utc::now()));

        assert_eq!(lines[0], "↻ @alice.bsky.social:");
        assert_eq!(lines.len(), plain.len() + 1);
        for (wrapped, original) in lines[1..].iter().zip(&plain) {
            assert_eq!(wrapped, &format!("{INDENT}{original}"));
        }
    }

    #[test]
    fn test_rendering_is_repeatable() {
        let mut p = post("same\ninput");
        p.embed = Some(Embed::QuotedPost(Box::new(quote("q", None))));
        let i = item(p);
        assert_eq!(render(&i), render(&i));
        assert_eq!(RenderedPost::from_item(&i), RenderedPost::from_item(&i));
    }

    #[test]
    fn test_rendered_post_attributes_reposter() {
        let bob = Author::new("did:plc:bob", "bob.bsky.social", None);
        let rendered =
            RenderedPost::from_item(&FeedItem::repost(post("x"), bob.clone(), Utc::now()));
        assert_eq!(rendered.author, bob);
        assert!(!rendered.is_empty());
    }
}
