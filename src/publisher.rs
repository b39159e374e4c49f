use std::collections::HashMap;
use std::sync::Arc;

use derivative::Derivative;
use tokio::sync::mpsc;

use crate::{
    error::{Error, SessionErrorKind},
    feed::{Feed, FeedId, MediaKind},
    media_track::MediaTrack,
    message::{ControlChannel, Jsep, Request, RoomEvent, RoomId, Role},
    negotiation::{NegotiationCoordinator, NegotiationPeer, PeerFactory, TrackEvent, TrackSpec},
};

/// What to send when publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub audio: bool,
    pub video: bool,
    /// Overrides the configured bitrate hint.
    pub bitrate: Option<u64>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            bitrate: None,
        }
    }
}

/// Drives the publisher handle: joining the room, sending local media and
/// leaving.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PublisherController {
    #[derivative(Debug = "ignore")]
    control: Arc<dyn ControlChannel>,
    #[derivative(Debug = "ignore")]
    factory: Arc<dyn PeerFactory>,
    #[derivative(Debug = "ignore")]
    track_sender: mpsc::UnboundedSender<TrackEvent>,
    #[derivative(Debug = "ignore")]
    peer: Option<Arc<dyn NegotiationPeer>>,
    coordinator: NegotiationCoordinator,
    bitrate: u64,
    local_tracks: HashMap<MediaKind, MediaTrack>,
    muted: HashMap<MediaKind, bool>,
    publishing: bool,
    local_feed: Option<FeedId>,
    private_id: Option<u64>,
}

impl PublisherController {
    pub fn new(
        control: Arc<dyn ControlChannel>,
        factory: Arc<dyn PeerFactory>,
        coordinator: NegotiationCoordinator,
        bitrate: u64,
        track_sender: mpsc::UnboundedSender<TrackEvent>,
    ) -> Self {
        Self {
            control,
            factory,
            track_sender,
            peer: None,
            coordinator,
            bitrate,
            local_tracks: HashMap::new(),
            muted: HashMap::new(),
            publishing: false,
            local_feed: None,
            private_id: None,
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.publishing
    }

    pub fn local_feed(&self) -> Option<&FeedId> {
        self.local_feed.as_ref()
    }

    pub fn private_id(&self) -> Option<u64> {
        self.private_id
    }

    pub fn is_muted(&self, kind: MediaKind) -> bool {
        self.muted.get(&kind).copied().unwrap_or(false)
    }

    pub fn local_track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.local_tracks.get(&kind)
    }

    /// Joins the room as a publisher and returns the events carried by the reply.
    pub async fn join(&mut self, room: RoomId, display_name: String) -> Result<Vec<RoomEvent>, Error> {
        tracing::info!("joining room {} as {}", room, display_name);
        let response = self
            .control
            .send(
                Role::Publisher,
                Request::JoinPublisher {
                    room,
                    display: display_name,
                },
            )
            .await?
            .into_result()?;
        Ok(RoomEvent::parse(&response.data))
    }

    pub fn set_joined(&mut self, id: FeedId, private_id: Option<u64>) {
        tracing::debug!("local feed is {}", id);
        self.local_feed = Some(id);
        if private_id.is_some() {
            self.private_id = private_id;
        }
    }

    pub async fn list_participants(&self, room: RoomId) -> Result<Vec<Feed>, Error> {
        let response = self
            .control
            .send(Role::Publisher, Request::ListParticipants { room })
            .await?
            .into_result()?;
        let participants = RoomEvent::parse(&response.data)
            .into_iter()
            .find_map(|event| match event {
                RoomEvent::Participants(feeds) => Some(feeds),
                _ => None,
            })
            .unwrap_or_default();
        Ok(participants)
    }

    /// Offers local media to the room. Publishing twice is a no-op.
    pub async fn publish(&mut self, options: PublishOptions) -> Result<(), Error> {
        if self.publishing {
            tracing::debug!("already publishing");
            return Ok(());
        }
        if !options.audio && !options.video {
            return Err(Error::new_session(
                "Nothing to publish".to_owned(),
                SessionErrorKind::InvalidStateError,
            ));
        }

        let tracks: Vec<TrackSpec> = [
            (MediaKind::Audio, options.audio),
            (MediaKind::Video, options.video),
        ]
        .into_iter()
        .filter(|(_, enabled)| *enabled)
        .map(|(kind, _)| TrackSpec {
            muted: self.is_muted(kind),
            ..TrackSpec::send(kind)
        })
        .collect();

        let created = self.peer.is_none();
        let peer = match &self.peer {
            Some(peer) => Arc::clone(peer),
            None => {
                let peer = self
                    .factory
                    .create_peer(Role::Publisher, self.track_sender.clone())
                    .await?;
                self.peer = Some(Arc::clone(&peer));
                peer
            }
        };

        match self.offer(peer.as_ref(), &tracks, &options).await {
            Ok(()) => {
                self.publishing = true;
                tracing::info!("publishing audio={} video={}", options.audio, options.video);
                Ok(())
            }
            Err(err) => {
                if created {
                    self.release_peer().await;
                }
                Err(err)
            }
        }
    }

    async fn offer(
        &self,
        peer: &dyn NegotiationPeer,
        tracks: &[TrackSpec],
        options: &PublishOptions,
    ) -> Result<(), Error> {
        let offer = self.coordinator.prepare_local_offer(peer, tracks).await?;
        let response = self
            .control
            .send(
                Role::Publisher,
                Request::Publish {
                    offer,
                    bitrate: Some(options.bitrate.unwrap_or(self.bitrate)),
                    audio: options.audio,
                    video: options.video,
                },
            )
            .await?
            .into_result()?;
        if let Some(answer) = response.jsep {
            self.coordinator.apply_remote_answer(peer, &answer).await?;
        }
        Ok(())
    }

    /// Applies an answer the backend delivered as an event.
    pub async fn handle_remote_answer(&self, answer: &Jsep) -> Result<(), Error> {
        match &self.peer {
            Some(peer) => self.coordinator.apply_remote_answer(peer.as_ref(), answer).await,
            None => {
                tracing::warn!("remote answer without a publisher peer, ignored");
                Ok(())
            }
        }
    }

    /// Mutes or unmutes local capture. Returns whether the state changed.
    pub async fn set_muted(&mut self, kind: MediaKind, muted: bool) -> Result<bool, Error> {
        if self.is_muted(kind) == muted {
            return Ok(false);
        }
        if let Some(peer) = &self.peer {
            peer.set_muted(kind, muted).await?;
        }
        self.muted.insert(kind, muted);
        tracing::debug!("local {} muted={}", kind, muted);
        Ok(true)
    }

    /// Stops sending local media. A no-op when not publishing.
    pub async fn unpublish(&mut self) -> Result<(), Error> {
        if !self.publishing {
            return Ok(());
        }
        self.control
            .send(Role::Publisher, Request::Unpublish)
            .await?
            .into_result()?;
        self.publishing = false;
        self.release_peer().await;
        tracing::info!("unpublished");
        Ok(())
    }

    /// Best-effort unpublish followed by the leave request.
    pub async fn leave(&mut self) -> Result<(), Error> {
        if let Err(err) = self.unpublish().await {
            tracing::warn!("failed to unpublish before leaving: {}", err);
            self.publishing = false;
        }
        self.control
            .send(Role::Publisher, Request::Leave)
            .await?
            .into_result()?;
        Ok(())
    }

    /// Records a local track of the publisher peer. Returns the track to
    /// announce, or `None` when the event changes nothing.
    pub fn on_local_track(&mut self, event: TrackEvent) -> Option<TrackEvent> {
        let kind = event.track.kind;
        if event.present {
            if let Some(previous) = self.local_tracks.insert(kind, event.track.clone()) {
                if previous.id != event.track.id {
                    previous.stop();
                }
            }
            Some(event)
        } else {
            match self.local_tracks.get(&kind) {
                Some(current) if current.id == event.track.id => {
                    if let Some(track) = self.local_tracks.remove(&kind) {
                        track.stop();
                    }
                    Some(event)
                }
                _ => None,
            }
        }
    }

    async fn release_peer(&mut self) {
        for (_, track) in self.local_tracks.drain() {
            track.stop();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(err) = peer.close().await {
                tracing::warn!("failed to close publisher peer: {}", err);
            }
        }
    }

    /// Releases the publisher peer and local tracks. Safe to call repeatedly.
    pub async fn release(&mut self) {
        self.publishing = false;
        self.release_peer().await;
        self.local_feed = None;
        self.private_id = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{init_tracing, test_track, MockControl, MockFactory};

    fn controller() -> (PublisherController, Arc<MockControl>, Arc<MockFactory>) {
        init_tracing();
        let control = Arc::new(MockControl::default());
        let factory = Arc::new(MockFactory::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let controller = PublisherController::new(
            control.clone(),
            factory.clone(),
            NegotiationCoordinator::new(true),
            256_000,
            tx,
        );
        (controller, control, factory)
    }

    #[tokio::test]
    async fn test_join_parses_reply() {
        let (mut controller, control, _) = controller();
        let events = controller
            .join(FeedId::Number(1234), "alice".to_owned())
            .await
            .unwrap();
        assert!(matches!(events[0], RoomEvent::Joined { .. }));
        assert_eq!(control.count(Role::Publisher, "join"), 1);
        match &control.requests(Role::Publisher)[0] {
            Request::JoinPublisher { room, display } => {
                assert_eq!(room, &FeedId::Number(1234));
                assert_eq!(display, "alice");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_sends_offer_with_bitrate_and_stereo() {
        let (mut controller, control, factory) = controller();
        controller.publish(PublishOptions::default()).await.unwrap();
        assert!(controller.is_publishing());

        match &control.requests(Role::Publisher)[0] {
            Request::Publish { offer, bitrate, audio, video } => {
                assert_eq!(bitrate, &Some(256_000));
                assert!(*audio && *video);
                assert!(offer.sdp.contains("useinbandfec=1;stereo=1"));
            }
            other => panic!("unexpected request: {:?}", other),
        }
        let peer = factory.peer(Role::Publisher).unwrap();
        assert_eq!(peer.remote().len(), 1);

        // Second publish is a no-op.
        controller.publish(PublishOptions::default()).await.unwrap();
        assert_eq!(control.count(Role::Publisher, "publish"), 1);
        assert_eq!(factory.created(Role::Publisher), 1);
    }

    #[tokio::test]
    async fn test_bitrate_override() {
        let (mut controller, control, _) = controller();
        controller
            .publish(PublishOptions {
                audio: true,
                video: false,
                bitrate: Some(128_000),
            })
            .await
            .unwrap();
        match &control.requests(Role::Publisher)[0] {
            Request::Publish { bitrate, video, .. } => {
                assert_eq!(bitrate, &Some(128_000));
                assert!(!video);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_publish_releases_peer() {
        let (mut controller, control, factory) = controller();
        control.fail_next("publish");
        assert!(controller.publish(PublishOptions::default()).await.is_err());
        assert!(!controller.is_publishing());
        assert_eq!(factory.closed(Role::Publisher), 1);

        controller.publish(PublishOptions::default()).await.unwrap();
        assert!(controller.is_publishing());
        assert_eq!(factory.created(Role::Publisher), 2);
    }

    #[tokio::test]
    async fn test_mute_is_applied_to_peer_and_next_offer() {
        let (mut controller, _, factory) = controller();
        assert!(controller.set_muted(MediaKind::Audio, true).await.unwrap());
        assert!(!controller.set_muted(MediaKind::Audio, true).await.unwrap());

        controller.publish(PublishOptions::default()).await.unwrap();
        let peer = factory.peer(Role::Publisher).unwrap();
        let offered = &peer.offers()[0];
        assert!(offered.iter().any(|t| t.kind == MediaKind::Audio && t.muted));
        assert!(offered.iter().any(|t| t.kind == MediaKind::Video && !t.muted));

        assert!(controller.set_muted(MediaKind::Video, true).await.unwrap());
        assert_eq!(peer.muted(), vec![(MediaKind::Video, true)]);
    }

    #[tokio::test]
    async fn test_unpublish_releases_local_media() {
        let (mut controller, control, factory) = controller();
        controller.publish(PublishOptions::default()).await.unwrap();
        let (track, stops) = test_track("local-audio", MediaKind::Audio);
        assert!(controller
            .on_local_track(TrackEvent {
                mid: Some("0".to_owned()),
                track,
                present: true,
            })
            .is_some());

        controller.unpublish().await.unwrap();
        controller.unpublish().await.unwrap();
        assert_eq!(control.count(Role::Publisher, "unpublish"), 1);
        assert_eq!(stops.count(), 1);
        assert_eq!(factory.closed(Role::Publisher), 1);
        assert!(controller.local_track(MediaKind::Audio).is_none());
    }

    #[tokio::test]
    async fn test_leave_continues_after_failed_unpublish() {
        let (mut controller, control, _) = controller();
        controller.publish(PublishOptions::default()).await.unwrap();
        control.fail_next("unpublish");
        controller.leave().await.unwrap();
        assert_eq!(control.count(Role::Publisher, "leave"), 1);
        assert!(!controller.is_publishing());
    }

    #[test]
    fn test_stale_local_track_removal_is_ignored() {
        let (mut controller, _, _) = controller();
        let (current, current_stops) = test_track("v2", MediaKind::Video);
        let (stale, _) = test_track("v1", MediaKind::Video);
        controller.on_local_track(TrackEvent {
            mid: None,
            track: current,
            present: true,
        });
        assert!(controller
            .on_local_track(TrackEvent {
                mid: None,
                track: stale,
                present: false,
            })
            .is_none());
        assert_eq!(current_stops.count(), 0);
        assert!(controller.local_track(MediaKind::Video).is_some());
    }
}
