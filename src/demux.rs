use std::collections::HashMap;
use std::sync::Arc;

use derivative::Derivative;

use crate::{
    feed::{FeedId, MediaKind},
    media_track::MediaTrack,
    registry::FeedRegistry,
};

/// Consumer of remote media, typically a rendering layer.
pub trait MediaSink: Send + Sync {
    fn present(&self, feed: &FeedId, kind: MediaKind, track: &MediaTrack);
    fn clear(&self, feed: &FeedId, kind: MediaKind);
}

/// Remote media of one subscribed feed: at most one track per kind.
#[derive(Debug, Default, Clone)]
pub struct RemoteMediaEntry {
    audio: Option<MediaTrack>,
    video: Option<MediaTrack>,
}

impl RemoteMediaEntry {
    pub fn get(&self, kind: MediaKind) -> Option<&MediaTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<MediaTrack> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Presented(FeedId),
    Replaced(FeedId),
    Cleared(FeedId),
    /// Nothing changed, e.g. the same track was announced twice.
    Ignored,
    /// No known feed owns the mid.
    Dropped,
}

/// Routes inbound tracks of the subscriber connection to their feed.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TrackDemultiplexer {
    entries: HashMap<FeedId, RemoteMediaEntry>,
    #[derivative(Debug = "ignore")]
    sink: Arc<dyn MediaSink>,
}

impl TrackDemultiplexer {
    pub fn new(sink: Arc<dyn MediaSink>) -> Self {
        Self {
            entries: HashMap::new(),
            sink,
        }
    }

    pub fn on_track(
        &mut self,
        registry: &FeedRegistry,
        mid: &str,
        track: MediaTrack,
        present: bool,
    ) -> TrackOutcome {
        let feed_id = match registry.stream_owner(mid) {
            Some(id) => id.clone(),
            None => {
                tracing::debug!(
                    "track {} for mid {} has no owning feed, dropped",
                    track.id,
                    mid
                );
                // Nobody will ever own this track.
                track.stop();
                return TrackOutcome::Dropped;
            }
        };
        let kind = track.kind;

        if present {
            let entry = self.entries.entry(feed_id.clone()).or_default();
            let slot = entry.slot_mut(kind);
            match slot.take() {
                Some(current) if current.id == track.id => {
                    *slot = Some(current);
                    TrackOutcome::Ignored
                }
                Some(current) => {
                    current.stop();
                    *slot = Some(track.clone());
                    self.sink.present(&feed_id, kind, &track);
                    TrackOutcome::Replaced(feed_id)
                }
                None => {
                    *slot = Some(track.clone());
                    self.sink.present(&feed_id, kind, &track);
                    TrackOutcome::Presented(feed_id)
                }
            }
        } else {
            let Some(entry) = self.entries.get_mut(&feed_id) else {
                return TrackOutcome::Ignored;
            };
            let is_current = entry
                .get(kind)
                .map(|current| current.id == track.id)
                .unwrap_or(false);
            if !is_current {
                return TrackOutcome::Ignored;
            }
            if let Some(current) = entry.slot_mut(kind).take() {
                current.stop();
            }
            let empty = entry.is_empty();
            self.sink.clear(&feed_id, kind);
            if empty {
                self.entries.remove(&feed_id);
            }
            TrackOutcome::Cleared(feed_id)
        }
    }

    /// Releases every track of the feed. Safe to call before or after the
    /// corresponding track removal events.
    pub fn on_feed_removed(&mut self, feed_id: &FeedId) -> usize {
        let Some(entry) = self.entries.remove(feed_id) else {
            return 0;
        };
        let mut released = 0;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if let Some(track) = entry.get(kind) {
                if track.stop() {
                    released += 1;
                }
                self.sink.clear(feed_id, kind);
            }
        }
        tracing::debug!("released {} remote tracks of feed {}", released, feed_id);
        released
    }

    pub fn clear_all(&mut self) -> usize {
        let ids: Vec<FeedId> = self.entries.keys().cloned().collect();
        ids.iter().map(|id| self.on_feed_removed(id)).sum()
    }

    pub fn entry(&self, feed_id: &FeedId) -> Option<&RemoteMediaEntry> {
        self.entries.get(feed_id)
    }

    pub fn open_tracks(&self) -> usize {
        self.entries
            .values()
            .map(|e| e.audio.iter().count() + e.video.iter().count())
            .sum()
    }
}
