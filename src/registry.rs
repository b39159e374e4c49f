use std::collections::HashMap;

use indexmap::IndexMap;

use crate::{
    error::{Error, SessionErrorKind},
    feed::{Feed, FeedId},
};

/// Known remote feeds in discovery order, plus the mid -> feed index used to
/// route inbound tracks.
#[derive(Debug, Default, Clone)]
pub struct FeedRegistry {
    feeds: IndexMap<FeedId, Feed>,
    stream_index: HashMap<String, FeedId>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a feed. Every mid previously owned by the feed is
    /// dropped before the new streams are installed. A mid that another feed
    /// still claims is moved to this feed and removed from the other one.
    pub fn upsert(&mut self, mut feed: Feed) -> Result<(), Error> {
        if feed.id.is_empty() {
            return Err(Error::new_session(
                "Feed without identifier".to_owned(),
                SessionErrorKind::FeedNotFoundError,
            ));
        }

        self.stream_index.retain(|_, owner| *owner != feed.id);

        let mut seen = Vec::with_capacity(feed.streams.len());
        feed.streams.retain(|s| {
            if seen.contains(&s.mid) {
                false
            } else {
                seen.push(s.mid.clone());
                true
            }
        });

        for stream in feed.streams.iter() {
            if let Some(previous) = self.stream_index.get(&stream.mid).cloned() {
                tracing::debug!(
                    "mid {} moves from feed {} to feed {}",
                    stream.mid,
                    previous,
                    feed.id
                );
                if let Some(other) = self.feeds.get_mut(&previous) {
                    other.streams.retain(|s| s.mid != stream.mid);
                }
            }
            self.stream_index
                .insert(stream.mid.clone(), feed.id.clone());
        }

        match self.feeds.get_mut(&feed.id) {
            // Keep the discovery position of a republished feed.
            Some(existing) => *existing = feed,
            None => {
                self.feeds.insert(feed.id.clone(), feed);
            }
        }
        Ok(())
    }

    /// Removes a feed together with all of its index entries.
    pub fn remove(&mut self, id: &FeedId) -> Option<Feed> {
        let removed = self.feeds.shift_remove(id)?;
        self.stream_index.retain(|_, owner| owner != id);
        Some(removed)
    }

    pub fn get(&self, id: &FeedId) -> Option<&Feed> {
        self.feeds.get(id)
    }

    pub fn contains(&self, id: &FeedId) -> bool {
        self.feeds.contains_key(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Feed> {
        self.feeds.values()
    }

    pub fn ids(&self) -> Vec<FeedId> {
        self.feeds.keys().cloned().collect()
    }

    pub fn stream_owner(&self, mid: &str) -> Option<&FeedId> {
        self.stream_index.get(mid)
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    pub fn clear(&mut self) {
        self.feeds.clear();
        self.stream_index.clear();
    }
}
