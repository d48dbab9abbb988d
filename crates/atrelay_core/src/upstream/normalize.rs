//! Conversion of atrium's `app.bsky` views into [`crate::feed`] types.
//!
//! Embeds, repost reasons and facet features are open unions. Members we
//! don't show (and blocked or missing quoted records) become "no embed"
//! rather than failing the whole timeline page.

use atrium_api::app::bsky::actor::defs::ProfileViewBasic;
use atrium_api::app::bsky::embed::record::{ViewRecordEmbedsItem, ViewRecordRefs};
use atrium_api::app::bsky::embed::record_with_media::ViewMediaRefs;
use atrium_api::app::bsky::embed::{external, images, video};
use atrium_api::app::bsky::feed::defs::{
    FeedViewPost, FeedViewPostReasonRefs, PostView, PostViewEmbedRefs,
};
use atrium_api::app::bsky::feed::post;
use atrium_api::app::bsky::richtext::facet::MainFeaturesItem;
use atrium_api::types::{TryFromUnknown, Union, Unknown};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::author::Author;
use crate::feed::{Embed, FeedItem, ImageRef, Post, QuotedPost, ReplyMarker};

impl From<&ProfileViewBasic> for Author {
    fn from(profile: &ProfileViewBasic) -> Self {
        Author::new(
            profile.data.did.to_string(),
            profile.data.handle.to_string(),
            profile.data.display_name.clone(),
        )
    }
}

impl From<FeedViewPost> for FeedItem {
    fn from(view: FeedViewPost) -> Self {
        let post = normalize_post(&view.data.post);
        match &view.data.reason {
            Some(Union::Refs(FeedViewPostReasonRefs::ReasonRepost(repost))) => FeedItem::repost(
                post,
                Author::from(&repost.data.by),
                parse_time(repost.data.indexed_at.as_str()),
            ),
            // pins and future reason kinds are not reposts
            _ => FeedItem::original(post),
        }
    }
}

fn normalize_post(view: &PostView) -> Post {
    let record = post_record(&view.data.record);
    let created_at = record
        .as_ref()
        .map(|record| parse_time(record.data.created_at.as_str()))
        .unwrap_or_else(|| parse_time(view.data.indexed_at.as_str()));

    Post {
        cid: view.data.cid.as_ref().to_string(),
        uri: view.data.uri.clone(),
        author: Author::from(&view.data.author),
        created_at,
        text: record
            .as_ref()
            .map(|record| record.data.text.clone())
            .unwrap_or_default(),
        facets: record.as_ref().map(facet_links).unwrap_or_default(),
        embed: view.data.embed.as_ref().and_then(normalize_embed),
        reply: record.and_then(|record| {
            record.data.reply.as_ref().map(|reply| ReplyMarker {
                parent_uri: reply.data.parent.data.uri.clone(),
            })
        }),
    }
}

/// Convert a post view's embed into an [`Embed`]; `None` for shapes we don't show.
pub fn normalize_embed(embed: &Union<PostViewEmbedRefs>) -> Option<Embed> {
    let Union::Refs(embed) = embed else {
        return None;
    };
    match embed {
        PostViewEmbedRefs::AppBskyEmbedImagesView(view) => Some(image_set(view)),
        PostViewEmbedRefs::AppBskyEmbedExternalView(view) => Some(external_link(view)),
        PostViewEmbedRefs::AppBskyEmbedVideoView(view) => Some(video_embed(view)),
        PostViewEmbedRefs::AppBskyEmbedRecordView(view) => {
            normalize_quote(&view.data.record).map(|quote| Embed::QuotedPost(Box::new(quote)))
        }
        PostViewEmbedRefs::AppBskyEmbedRecordWithMediaView(view) => {
            let media = normalize_media(&view.data.media);
            quote_with_media(normalize_quote(&view.data.record.data.record), media)
        }
    }
}

/// Embeds carried by a quoted record.
fn normalize_record_embed(embed: &Union<ViewRecordEmbedsItem>) -> Option<Embed> {
    match embed {
        Union::Refs(ViewRecordEmbedsItem::AppBskyEmbedImagesView(view)) => Some(image_set(view)),
        Union::Refs(ViewRecordEmbedsItem::AppBskyEmbedExternalView(view)) => {
            Some(external_link(view))
        }
        Union::Refs(ViewRecordEmbedsItem::AppBskyEmbedVideoView(view)) => Some(video_embed(view)),
        Union::Refs(ViewRecordEmbedsItem::AppBskyEmbedRecordView(view)) => {
            normalize_quote(&view.data.record).map(|quote| Embed::QuotedPost(Box::new(quote)))
        }
        Union::Refs(ViewRecordEmbedsItem::AppBskyEmbedRecordWithMediaView(view)) => {
            let media = normalize_media(&view.data.media);
            quote_with_media(normalize_quote(&view.data.record.data.record), media)
        }
        _ => None,
    }
}

fn normalize_media(media: &Union<ViewMediaRefs>) -> Option<Embed> {
    match media {
        Union::Refs(ViewMediaRefs::AppBskyEmbedImagesView(view)) => Some(image_set(view)),
        Union::Refs(ViewMediaRefs::AppBskyEmbedVideoView(view)) => Some(video_embed(view)),
        Union::Refs(ViewMediaRefs::AppBskyEmbedExternalView(view)) => Some(external_link(view)),
        _ => None,
    }
}

fn quote_with_media(quote: Option<QuotedPost>, media: Option<Embed>) -> Option<Embed> {
    match (quote, media) {
        (Some(quote), Some(media)) => Some(Embed::QuoteWithMedia {
            quote: Box::new(quote),
            media: Box::new(media),
        }),
        (Some(quote), None) => Some(Embed::QuotedPost(Box::new(quote))),
        (None, media) => media,
    }
}

fn normalize_quote(record: &Union<ViewRecordRefs>) -> Option<QuotedPost> {
    // blocked, not found, detached, feed generators, lists...
    let Union::Refs(ViewRecordRefs::ViewRecord(record)) = record else {
        return None;
    };

    let value = post_record(&record.data.value);
    Some(QuotedPost {
        uri: record.data.uri.clone(),
        author: Author::from(&record.data.author),
        text: value
            .as_ref()
            .map(|value| value.data.text.clone())
            .unwrap_or_default(),
        facets: value.as_ref().map(facet_links).unwrap_or_default(),
        embed: record
            .data
            .embeds
            .iter()
            .flatten()
            .find_map(normalize_record_embed),
    })
}

fn image_set(view: &images::View) -> Embed {
    Embed::ImageSet {
        items: view
            .data
            .images
            .iter()
            .map(|image| ImageRef {
                alt: non_blank(Some(&image.data.alt)),
                url: image.data.fullsize.clone(),
            })
            .collect(),
    }
}

fn external_link(view: &external::View) -> Embed {
    Embed::External {
        uri: view.data.external.data.uri.clone(),
    }
}

fn video_embed(view: &video::View) -> Embed {
    Embed::Video {
        alt: non_blank(view.data.alt.as_ref()),
        cid: view.data.cid.as_ref().to_string(),
        did: playlist_did(&view.data.playlist),
    }
}

/// Decode an `app.bsky.feed.post` record. A record that doesn't match the
/// lexicon degrades to an empty post instead of dropping the entry.
fn post_record(value: &Unknown) -> Option<post::Record> {
    match post::Record::try_from_unknown(value.clone()) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!("post record did not match app.bsky.feed.post: {:?}", e);
            None
        }
    }
}

fn facet_links(record: &post::Record) -> Vec<String> {
    record
        .data
        .facets
        .iter()
        .flatten()
        .flat_map(|facet| facet.data.features.iter())
        .filter_map(|feature| match feature {
            Union::Refs(MainFeaturesItem::Link(link)) => Some(link.data.uri.clone()),
            _ => None,
        })
        .collect()
}

fn non_blank(text: Option<&String>) -> Option<String> {
    text.filter(|text| !text.trim().is_empty()).cloned()
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Pull the owning DID out of a video playlist URL, e.g.
/// `https://video.bsky.app/watch/did%3Aplc%3Aabc/bafy.../playlist.m3u8`.
fn playlist_did(playlist: &str) -> Option<String> {
    let (_, rest) = playlist.split_once("/watch/")?;
    let segment = rest.split('/').next()?;
    let did = segment.replace("%3A", ":").replace("%3a", ":");
    did.starts_with("did:").then_some(did)
}
