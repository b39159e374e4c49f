use std::fmt;
use std::sync::Arc;

use derivative::Derivative;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    demux::{MediaSink, RemoteMediaEntry, TrackDemultiplexer},
    error::{Error, ProtocolErrorKind, SessionErrorKind, TransportErrorKind, ROOM_NOT_FOUND_CODE},
    feed::{Feed, FeedId, MediaKind},
    media_track::MediaTrack,
    message::{ControlChannel, ControlEvent, Jsep, JsepType, RoomEvent, RoomId, Role},
    negotiation::{NegotiationCoordinator, PeerFactory, TrackEvent},
    publisher::{PublishOptions, PublisherController},
    registry::FeedRegistry,
    subscriber::SubscriptionScheduler,
};

/// Lifecycle of a [`Session`]. A disconnected session moves back to `Idle`
/// when it reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Joining,
    Joined,
    Publishing,
    Leaving,
    Disconnected,
}

impl SessionState {
    fn is_in_room(&self) -> bool {
        matches!(self, SessionState::Joined | SessionState::Publishing)
    }

    fn is_active(&self) -> bool {
        !matches!(
            self,
            SessionState::Idle | SessionState::Leaving | SessionState::Disconnected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Joining => "joining",
            SessionState::Joined => "joined",
            SessionState::Publishing => "publishing",
            SessionState::Leaving => "leaving",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct FeedsChanged {
    pub added: Vec<Feed>,
    pub removed: Vec<FeedId>,
}

#[derive(Debug, Clone)]
pub struct LocalTrackEvent {
    pub track: MediaTrack,
    pub present: bool,
}

/// `track` is `None` when the feed's media of that kind was cleared.
#[derive(Debug, Clone)]
pub struct RemoteTrackEvent {
    pub feed: FeedId,
    pub kind: MediaKind,
    pub track: Option<MediaTrack>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChanged {
    pub previous: SessionState,
    pub current: SessionState,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub operation: &'static str,
    pub feed: Option<FeedId>,
    pub error: Arc<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowLinkEvent {
    pub role: Role,
    pub uplink: bool,
    pub lost: u64,
}

/// Broadcast senders of every session event category.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    feeds_changed: broadcast::Sender<FeedsChanged>,
    local_track: broadcast::Sender<LocalTrackEvent>,
    remote_track: broadcast::Sender<RemoteTrackEvent>,
    state_changed: broadcast::Sender<StateChanged>,
    error: broadcast::Sender<ErrorEvent>,
    slow_link: broadcast::Sender<SlowLinkEvent>,
}

impl SessionEvents {
    fn new() -> Self {
        let (feeds_changed, _) = broadcast::channel(256);
        let (local_track, _) = broadcast::channel(64);
        let (remote_track, _) = broadcast::channel(256);
        let (state_changed, _) = broadcast::channel(64);
        let (error, _) = broadcast::channel(256);
        let (slow_link, _) = broadcast::channel(64);
        Self {
            feeds_changed,
            local_track,
            remote_track,
            state_changed,
            error,
            slow_link,
        }
    }
}

// Sending fails only when nobody listens, which is fine.
impl MediaSink for SessionEvents {
    fn present(&self, feed: &FeedId, kind: MediaKind, track: &MediaTrack) {
        let _ = self.remote_track.send(RemoteTrackEvent {
            feed: feed.clone(),
            kind,
            track: Some(track.clone()),
        });
    }

    fn clear(&self, feed: &FeedId, kind: MediaKind) {
        let _ = self.remote_track.send(RemoteTrackEvent {
            feed: feed.clone(),
            kind,
            track: None,
        });
    }
}

/// A client session in a video room. Clones share the same session.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Session {
    pub id: String,
    #[derivative(Debug = "ignore")]
    control: Arc<dyn ControlChannel>,
    #[derivative(Debug = "ignore")]
    factory: Arc<dyn PeerFactory>,
    state: Arc<Mutex<SessionState>>,
    room: Arc<Mutex<Option<RoomId>>>,
    local_feed: Arc<Mutex<Option<FeedId>>>,
    registry: Arc<Mutex<FeedRegistry>>,
    demux: Arc<Mutex<TrackDemultiplexer>>,
    publisher: Arc<Mutex<Option<PublisherController>>>,
    scheduler: Arc<Mutex<Option<Arc<SubscriptionScheduler>>>>,
    stop_sender: Arc<Mutex<Option<mpsc::UnboundedSender<()>>>>,
    events: SessionEvents,
}

impl Session {
    pub fn new(control: Arc<dyn ControlChannel>, factory: Arc<dyn PeerFactory>) -> Self {
        let id = Uuid::new_v4().to_string();
        let events = SessionEvents::new();
        let demux = TrackDemultiplexer::new(Arc::new(events.clone()));

        tracing::debug!("Session {} is created", id);

        Self {
            id,
            control,
            factory,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            room: Arc::new(Mutex::new(None)),
            local_feed: Arc::new(Mutex::new(None)),
            registry: Arc::new(Mutex::new(FeedRegistry::new())),
            demux: Arc::new(Mutex::new(demux)),
            publisher: Arc::new(Mutex::new(None)),
            scheduler: Arc::new(Mutex::new(None)),
            stop_sender: Arc::new(Mutex::new(None)),
            events,
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn feeds(&self) -> Vec<Feed> {
        self.registry.lock().await.all().cloned().collect()
    }

    pub async fn local_feed(&self) -> Option<FeedId> {
        self.local_feed.lock().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<FeedId> {
        match self.scheduler.lock().await.as_ref() {
            Some(scheduler) => scheduler.subscriptions().await,
            None => vec![],
        }
    }

    pub async fn remote_media(&self, feed: &FeedId) -> Option<RemoteMediaEntry> {
        self.demux.lock().await.entry(feed).cloned()
    }

    // Event streams

    pub fn on_feeds_changed(&self) -> broadcast::Receiver<FeedsChanged> {
        self.events.feeds_changed.subscribe()
    }

    pub fn on_local_track(&self) -> broadcast::Receiver<LocalTrackEvent> {
        self.events.local_track.subscribe()
    }

    pub fn on_remote_track(&self) -> broadcast::Receiver<RemoteTrackEvent> {
        self.events.remote_track.subscribe()
    }

    pub fn on_state_changed(&self) -> broadcast::Receiver<StateChanged> {
        self.events.state_changed.subscribe()
    }

    pub fn on_error(&self) -> broadcast::Receiver<ErrorEvent> {
        self.events.error.subscribe()
    }

    pub fn on_slow_link(&self) -> broadcast::Receiver<SlowLinkEvent> {
        self.events.slow_link.subscribe()
    }

    // State machine

    async fn set_state(&self, current: SessionState) {
        let previous = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, current)
        };
        self.state_changed(previous, current);
    }

    async fn transition(
        &self,
        allowed: &[SessionState],
        current: SessionState,
    ) -> Result<SessionState, Error> {
        let previous = {
            let mut state = self.state.lock().await;
            if !allowed.contains(&*state) {
                return Err(Error::new_session(
                    format!("Cannot move to {} while {}", current, *state),
                    SessionErrorKind::InvalidStateError,
                ));
            }
            std::mem::replace(&mut *state, current)
        };
        self.state_changed(previous, current);
        Ok(previous)
    }

    fn state_changed(&self, previous: SessionState, current: SessionState) {
        if previous == current {
            return;
        }
        tracing::info!("Session {} state: {} -> {}", self.id, previous, current);
        let _ = self
            .events
            .state_changed
            .send(StateChanged { previous, current });
    }

    async fn require_in_room(&self) -> Result<(), Error> {
        let state = self.state().await;
        if state.is_in_room() {
            return Ok(());
        }
        Err(Error::new_session(
            format!("Not in a room while {}", state),
            SessionErrorKind::InvalidStateError,
        ))
    }

    fn report(&self, operation: &'static str, feed: Option<FeedId>, error: Error) {
        tracing::error!("{} failed: {}", operation, error);
        let _ = self.events.error.send(ErrorEvent {
            operation,
            feed,
            error: Arc::new(error),
        });
    }

    async fn scheduler(&self) -> Result<Arc<SubscriptionScheduler>, Error> {
        self.scheduler.lock().await.clone().ok_or_else(|| {
            Error::new_session(
                "Session is not connected".to_owned(),
                SessionErrorKind::InvalidStateError,
            )
        })
    }

    // Imperative surface

    /// Opens the signaling session and attaches the publisher handle. The
    /// peer factory receives the config first, so its ICE servers apply to
    /// every peer of this connection.
    pub async fn connect(&self, config: SessionConfig) -> Result<(), Error> {
        config.validate()?;
        let _ = self
            .transition(&[SessionState::Disconnected], SessionState::Idle)
            .await;
        self.transition(&[SessionState::Idle], SessionState::Connecting)
            .await?;

        if let Err(err) = self.open(&config).await {
            self.set_state(SessionState::Idle).await;
            self.report("connect", None, Error::new_transport(
                format!("failed to connect to {}: {}", config.server, err),
                TransportErrorKind::ConnectionError,
            ));
            return Err(err);
        }

        self.set_state(SessionState::Connected).await;
        Ok(())
    }

    async fn open(&self, config: &SessionConfig) -> Result<(), Error> {
        self.factory.configure(config).await;
        self.control.create_session(config).await?;
        if let Err(err) = self.control.attach(Role::Publisher).await {
            if let Err(err) = self.control.destroy().await {
                tracing::warn!("failed to destroy signaling session: {}", err);
            }
            return Err(err);
        }

        let coordinator = NegotiationCoordinator::new(config.stereo);
        let (publisher_sender, publisher_tracks) = mpsc::unbounded_channel();
        let (subscriber_sender, subscriber_tracks) = mpsc::unbounded_channel();

        *self.publisher.lock().await = Some(PublisherController::new(
            Arc::clone(&self.control),
            Arc::clone(&self.factory),
            coordinator,
            config.bitrate,
            publisher_sender,
        ));
        *self.scheduler.lock().await = Some(Arc::new(SubscriptionScheduler::new(
            Arc::clone(&self.control),
            Arc::clone(&self.factory),
            Arc::clone(&self.registry),
            coordinator,
            config.max_concurrent_subscriptions,
            subscriber_sender,
        )));
        *self.room.lock().await = config.room.clone();

        let control_events = self.control.take_events();
        let (stop_sender, stop_receiver) = mpsc::unbounded_channel();
        *self.stop_sender.lock().await = Some(stop_sender);

        let session = self.clone();
        tokio::spawn(async move {
            session
                .event_loop(control_events, publisher_tracks, subscriber_tracks, stop_receiver)
                .await;
        });

        tracing::info!("Session {} connected to {}", self.id, config.server);
        Ok(())
    }

    /// Joins `room` as a publisher. Uses the configured room when `room` is `None`.
    pub async fn join(&self, room: Option<RoomId>, display: &str) -> Result<(), Error> {
        let room = match room {
            Some(room) => room,
            None => self.room.lock().await.clone().ok_or_else(|| {
                Error::new_session(
                    "No room to join".to_owned(),
                    SessionErrorKind::InvalidConfigError,
                )
            })?,
        };
        self.transition(&[SessionState::Connected], SessionState::Joining)
            .await?;

        *self.room.lock().await = Some(room.clone());
        if let Ok(scheduler) = self.scheduler().await {
            scheduler.set_membership(room.clone(), None, None).await;
        }

        let result = {
            let mut publisher = self.publisher.lock().await;
            match publisher.as_mut() {
                Some(publisher) => publisher.join(room, display.to_owned()).await,
                None => Err(Error::new_session(
                    "Session is not connected".to_owned(),
                    SessionErrorKind::InvalidStateError,
                )),
            }
        };

        match result {
            Ok(events) => {
                for event in events {
                    self.handle_room_event(Role::Publisher, event).await;
                }
                Ok(())
            }
            Err(err) => {
                let _ = self
                    .transition(&[SessionState::Joining], SessionState::Connected)
                    .await;
                self.report("join", None, clone_for_report(&err));
                Err(err)
            }
        }
    }

    /// Publishes local media. A no-op while already publishing.
    pub async fn publish(&self, options: PublishOptions) -> Result<(), Error> {
        match self.state().await {
            SessionState::Publishing => return Ok(()),
            SessionState::Joined => {}
            state => {
                return Err(Error::new_session(
                    format!("Cannot publish while {}", state),
                    SessionErrorKind::InvalidStateError,
                ))
            }
        }

        let result = {
            let mut publisher = self.publisher.lock().await;
            match publisher.as_mut() {
                Some(publisher) => publisher.publish(options).await,
                None => Ok(()),
            }
        };

        match result {
            Ok(()) => {
                let _ = self
                    .transition(&[SessionState::Joined], SessionState::Publishing)
                    .await;
                Ok(())
            }
            Err(err) => {
                self.report("publish", None, clone_for_report(&err));
                Err(err)
            }
        }
    }

    /// Stops publishing. A no-op while not publishing.
    pub async fn unpublish(&self) -> Result<(), Error> {
        if self.state().await != SessionState::Publishing {
            return Ok(());
        }
        {
            let mut publisher = self.publisher.lock().await;
            if let Some(publisher) = publisher.as_mut() {
                publisher.unpublish().await?;
            }
        }
        let _ = self
            .transition(&[SessionState::Publishing], SessionState::Joined)
            .await;
        Ok(())
    }

    pub async fn mute(&self, kind: MediaKind) -> Result<(), Error> {
        self.set_muted(kind, true).await
    }

    pub async fn unmute(&self, kind: MediaKind) -> Result<(), Error> {
        self.set_muted(kind, false).await
    }

    async fn set_muted(&self, kind: MediaKind, muted: bool) -> Result<(), Error> {
        let mut publisher = self.publisher.lock().await;
        let publisher = publisher.as_mut().ok_or_else(|| {
            Error::new_session(
                "Session is not connected".to_owned(),
                SessionErrorKind::InvalidStateError,
            )
        })?;
        publisher.set_muted(kind, muted).await?;
        Ok(())
    }

    pub async fn is_muted(&self, kind: MediaKind) -> bool {
        match self.publisher.lock().await.as_ref() {
            Some(publisher) => publisher.is_muted(kind),
            None => false,
        }
    }

    /// Subscribes to a feed outside of the automatic scheduling.
    pub async fn subscribe(&self, feed: FeedId) -> Result<(), Error> {
        self.require_in_room().await?;
        let scheduler = self.scheduler().await?;
        scheduler.subscribe(&feed).await
    }

    pub async fn unsubscribe(&self, feed: FeedId) -> Result<(), Error> {
        self.require_in_room().await?;
        let scheduler = self.scheduler().await?;
        scheduler.unsubscribe(&feed).await?;
        self.demux.lock().await.on_feed_removed(&feed);
        Ok(())
    }

    /// Replaces the known feeds with the backend's participant list.
    pub async fn refresh_participants(&self) -> Result<(), Error> {
        self.require_in_room().await?;
        let room = self.room.lock().await.clone().ok_or_else(|| {
            Error::new_session(
                "No room joined".to_owned(),
                SessionErrorKind::InvalidStateError,
            )
        })?;
        let participants = {
            let publisher = self.publisher.lock().await;
            match publisher.as_ref() {
                Some(publisher) => publisher.list_participants(room).await?,
                None => vec![],
            }
        };
        self.replace_feeds(participants).await;
        Ok(())
    }

    /// Leaves the room and releases every resource of the session.
    pub async fn leave(&self) -> Result<(), Error> {
        self.shutdown().await
    }

    /// Same teardown as [`Session::leave`], valid from any connected state.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.shutdown().await
    }

    async fn shutdown(&self) -> Result<(), Error> {
        if self.state().await == SessionState::Connecting {
            return Err(Error::new_session(
                "Connection is in progress".to_owned(),
                SessionErrorKind::InvalidStateError,
            ));
        }
        self.teardown().await;
        Ok(())
    }

    /// Runs every teardown step once, even if earlier steps fail. Concurrent
    /// callers return immediately once another teardown has started.
    async fn teardown(&self) {
        let previous = {
            let mut state = self.state.lock().await;
            match *state {
                SessionState::Idle
                | SessionState::Connecting
                | SessionState::Leaving
                | SessionState::Disconnected => return,
                previous => {
                    *state = SessionState::Leaving;
                    previous
                }
            }
        };
        self.state_changed(previous, SessionState::Leaving);

        if let Some(stop_sender) = self.stop_sender.lock().await.take() {
            let _ = stop_sender.send(());
        }

        let mut publisher = self.publisher.lock().await.take();
        let scheduler = self.scheduler.lock().await.take();

        if matches!(
            previous,
            SessionState::Joining | SessionState::Joined | SessionState::Publishing
        ) {
            if let Some(publisher) = publisher.as_mut() {
                if let Err(err) = publisher.leave().await {
                    tracing::warn!("failed to leave room: {}", err);
                }
            }
        }

        if let Some(scheduler) = scheduler {
            for err in scheduler.teardown().await {
                tracing::warn!("failed to release subscriber connection: {}", err);
            }
        }

        {
            let mut registry = self.registry.lock().await;
            let mut demux = self.demux.lock().await;
            let released = demux.clear_all();
            registry.clear();
            tracing::debug!("released {} remote tracks", released);
        }

        if let Some(mut publisher) = publisher {
            publisher.release().await;
        }
        if let Err(err) = self.control.detach(Role::Publisher).await {
            tracing::warn!("failed to detach publisher handle: {}", err);
        }
        if let Err(err) = self.control.destroy().await {
            tracing::warn!("failed to destroy signaling session: {}", err);
        }

        *self.local_feed.lock().await = None;
        self.set_state(SessionState::Disconnected).await;
        tracing::info!("Session {} is disconnected", self.id);
    }

    // Inbound events

    async fn event_loop(
        self,
        control_events: Option<mpsc::UnboundedReceiver<ControlEvent>>,
        mut publisher_tracks: mpsc::UnboundedReceiver<TrackEvent>,
        mut subscriber_tracks: mpsc::UnboundedReceiver<TrackEvent>,
        mut stop_receiver: mpsc::UnboundedReceiver<()>,
    ) {
        let (_idle_sender, idle_receiver) = mpsc::unbounded_channel();
        let mut control_events = match control_events {
            Some(events) => events,
            None => {
                tracing::warn!("Session {} has no control event stream", self.id);
                idle_receiver
            }
        };

        tracing::debug!("Session {} event loop has started", self.id);
        loop {
            tokio::select! {
                _stop = stop_receiver.recv() => {
                    break;
                }
                event = control_events.recv() => {
                    match event {
                        Some(event) => self.handle_control_event(event).await,
                        None => {
                            self.on_channel_closed().await;
                            break;
                        }
                    }
                }
                Some(event) = publisher_tracks.recv() => {
                    self.handle_local_track(event).await;
                }
                Some(event) = subscriber_tracks.recv() => {
                    self.handle_remote_track(event).await;
                }
            }
        }
        tracing::debug!("Session {} event loop has finished", self.id);
    }

    async fn on_channel_closed(&self) {
        if !self.state().await.is_active() {
            return;
        }
        self.report(
            "control channel",
            None,
            Error::new_transport(
                "Control channel closed".to_owned(),
                TransportErrorKind::ChannelClosedError,
            ),
        );
        self.teardown().await;
    }

    pub(crate) async fn handle_control_event(&self, event: ControlEvent) {
        if !self.state().await.is_active() {
            tracing::debug!("control event after teardown dropped: {}", event.data);
            return;
        }
        if let Some(jsep) = &event.jsep {
            self.handle_remote_jsep(event.role, jsep).await;
        }
        for room_event in RoomEvent::parse(&event.data) {
            self.handle_room_event(event.role, room_event).await;
        }
    }

    async fn handle_remote_jsep(&self, role: Role, jsep: &Jsep) {
        let result = match (role, jsep.kind) {
            (Role::Publisher, JsepType::Answer) => match self.publisher.lock().await.as_ref() {
                Some(publisher) => publisher.handle_remote_answer(jsep).await,
                None => Ok(()),
            },
            (Role::Subscriber, JsepType::Offer) => match self.scheduler().await {
                Ok(scheduler) => scheduler.handle_remote_offer(jsep).await,
                Err(err) => Err(err),
            },
            (role, kind) => {
                tracing::warn!("unexpected {:?} for {:?} handle ignored", kind, role);
                Ok(())
            }
        };
        if let Err(err) = result {
            self.report("negotiation", None, err);
        }
    }

    async fn handle_room_event(&self, role: Role, event: RoomEvent) {
        match event {
            RoomEvent::Joined {
                room,
                id,
                private_id,
                publishers,
            } => self.on_joined(room, id, private_id, publishers).await,
            RoomEvent::Publishers(feeds) => self.apply_feed_changes(feeds, vec![]).await,
            RoomEvent::Participants(feeds) => self.replace_feeds(feeds).await,
            RoomEvent::FeedLeft(id) => self.apply_feed_changes(vec![], vec![id]).await,
            RoomEvent::Destroyed => {
                tracing::warn!("Session {} room was destroyed", self.id);
                self.report(
                    "room",
                    None,
                    Error::new_protocol(
                        "Room was destroyed".to_owned(),
                        ProtocolErrorKind::RoomDestroyedError,
                        None,
                    ),
                );
                self.teardown().await;
            }
            RoomEvent::SlowLink { uplink, lost } => {
                tracing::warn!(
                    "slow link on {:?} handle: uplink={}, lost={}",
                    role,
                    uplink,
                    lost
                );
                let _ = self.events.slow_link.send(SlowLinkEvent { role, uplink, lost });
            }
            RoomEvent::Error { code, message } => {
                let kind = match code {
                    Some(ROOM_NOT_FOUND_CODE) => ProtocolErrorKind::RoomNotFoundError,
                    _ => ProtocolErrorKind::BackendError,
                };
                self.report("backend", None, Error::new_protocol(message, kind, code));
            }
        }
    }

    async fn on_joined(
        &self,
        room: Option<RoomId>,
        id: FeedId,
        private_id: Option<u64>,
        publishers: Vec<Feed>,
    ) {
        let joined = self
            .transition(&[SessionState::Joining], SessionState::Joined)
            .await
            .is_ok();
        if joined {
            tracing::info!("Session {} joined as feed {}", self.id, id);
        } else if !self.state().await.is_in_room() {
            tracing::debug!("joined event outside of joining dropped");
            return;
        }

        *self.local_feed.lock().await = Some(id.clone());
        if let Some(publisher) = self.publisher.lock().await.as_mut() {
            publisher.set_joined(id.clone(), private_id);
        }
        let room = match room {
            Some(room) => {
                *self.room.lock().await = Some(room.clone());
                Some(room)
            }
            None => self.room.lock().await.clone(),
        };
        if let (Some(room), Ok(scheduler)) = (room, self.scheduler().await) {
            scheduler.set_membership(room, Some(id), private_id).await;
        }

        self.apply_feed_changes(publishers, vec![]).await;
    }

    async fn replace_feeds(&self, feeds: Vec<Feed>) {
        let removed: Vec<FeedId> = self
            .registry
            .lock()
            .await
            .ids()
            .into_iter()
            .filter(|id| !feeds.iter().any(|feed| &feed.id == id))
            .collect();
        self.apply_feed_changes(feeds, removed).await;
    }

    async fn apply_feed_changes(&self, added: Vec<Feed>, removed: Vec<FeedId>) {
        let local_feed = self.local_feed.lock().await.clone();
        let mut changes = FeedsChanged {
            added: vec![],
            removed: vec![],
        };
        {
            let mut registry = self.registry.lock().await;
            let mut demux = self.demux.lock().await;
            for feed in added {
                if local_feed.as_ref() == Some(&feed.id) {
                    continue;
                }
                let id = feed.id.clone();
                match registry.upsert(feed) {
                    Ok(()) => {
                        if let Some(feed) = registry.get(&id) {
                            changes.added.push(feed.clone());
                        }
                    }
                    Err(err) => tracing::warn!("feed ignored: {}", err),
                }
            }
            for id in removed {
                let known = registry.remove(&id).is_some();
                let released = demux.on_feed_removed(&id);
                if known {
                    tracing::debug!("feed {} left, {} tracks released", id, released);
                    changes.removed.push(id);
                }
            }
        }

        if changes.added.is_empty() && changes.removed.is_empty() {
            return;
        }
        let added: Vec<FeedId> = changes.added.iter().map(|feed| feed.id.clone()).collect();
        let removed = changes.removed.clone();
        let _ = self.events.feeds_changed.send(changes);

        if self.state().await.is_in_room() {
            self.schedule(&added, &removed).await;
        }
    }

    async fn schedule(&self, added: &[FeedId], removed: &[FeedId]) {
        let Ok(scheduler) = self.scheduler().await else {
            return;
        };
        let report = scheduler.on_feeds_changed(added, removed).await;
        for (feed, error) in report.failed {
            let _ = self.events.error.send(ErrorEvent {
                operation: "subscribe",
                feed: Some(feed),
                error,
            });
        }
    }

    pub(crate) async fn handle_remote_track(&self, event: TrackEvent) {
        if !self.state().await.is_active() {
            event.track.stop();
            return;
        }
        let Some(mid) = event.mid.as_deref() else {
            tracing::debug!("remote track {} without mid dropped", event.track.id);
            event.track.stop();
            return;
        };
        let registry = self.registry.lock().await;
        let mut demux = self.demux.lock().await;
        let outcome = demux.on_track(&registry, mid, event.track.clone(), event.present);
        tracing::trace!("remote track {} on mid {}: {:?}", event.track.id, mid, outcome);
    }

    pub(crate) async fn handle_local_track(&self, event: TrackEvent) {
        let announced = match self.publisher.lock().await.as_mut() {
            Some(publisher) => publisher.on_local_track(event),
            None => {
                event.track.stop();
                None
            }
        };
        if let Some(event) = announced {
            let _ = self.events.local_track.send(LocalTrackEvent {
                track: event.track,
                present: event.present,
            });
        }
    }
}

// Errors are not `Clone`; the event stream gets an equivalent copy.
fn clone_for_report(err: &Error) -> Error {
    match err {
        Error::TransportError(e) => Error::new_transport(e.message.clone(), e.kind),
        Error::NegotiationError(e) => Error::new_negotiation(e.message.clone(), e.kind),
        Error::ProtocolError(e) => Error::new_protocol(e.message.clone(), e.kind, e.code),
        Error::SessionError(e) => Error::new_session(e.message.clone(), e.kind),
        other => Error::new_transport(other.to_string(), TransportErrorKind::PeerConnectionError),
    }
}
