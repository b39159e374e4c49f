use std::collections::HashSet;
use std::sync::Arc;

use derivative::Derivative;
use indexmap::IndexSet;
use tokio::sync::{mpsc, Mutex};

use crate::{
    error::{Error, SessionErrorKind},
    feed::{FeedId, MediaKind},
    message::{ControlChannel, Jsep, Request, RoomId, Role, StreamRef},
    negotiation::{NegotiationCoordinator, NegotiationPeer, PeerFactory, TrackEvent, TrackSpec},
    registry::FeedRegistry,
};

const RECV_TRACKS: [TrackSpec; 2] = [
    TrackSpec {
        kind: MediaKind::Audio,
        capture: false,
        recv: true,
        muted: false,
    },
    TrackSpec {
        kind: MediaKind::Video,
        capture: false,
        recv: true,
        muted: false,
    },
];

/// Outcome of one scheduling pass.
#[derive(Debug, Default, Clone)]
pub struct ScheduleReport {
    pub subscribed: Vec<FeedId>,
    pub unsubscribed: Vec<FeedId>,
    /// Feeds without subscribable streams.
    pub skipped: Vec<FeedId>,
    /// Feeds left out because the subscription limit was reached.
    pub pending: Vec<FeedId>,
    pub failed: Vec<(FeedId, Arc<Error>)>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    subscribed: IndexSet<FeedId>,
    in_flight: HashSet<FeedId>,
    cancelled: HashSet<FeedId>,
    skipped: HashSet<FeedId>,
    local_feed: Option<FeedId>,
    room: Option<RoomId>,
    private_id: Option<u64>,
    /// Set once by `teardown`; the connection is never acquired again.
    closed: bool,
}

/// The single multiplexed subscriber connection. Holding its lock is what
/// serializes renegotiations.
#[derive(Derivative, Default)]
#[derivative(Debug)]
struct SubscriberConnection {
    #[derivative(Debug = "ignore")]
    peer: Option<Arc<dyn NegotiationPeer>>,
    attached: bool,
    joined: bool,
}

/// Decides which feeds to receive and drives the subscriber connection.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SubscriptionScheduler {
    #[derivative(Debug = "ignore")]
    control: Arc<dyn ControlChannel>,
    #[derivative(Debug = "ignore")]
    factory: Arc<dyn PeerFactory>,
    #[derivative(Debug = "ignore")]
    registry: Arc<Mutex<FeedRegistry>>,
    #[derivative(Debug = "ignore")]
    track_sender: mpsc::UnboundedSender<TrackEvent>,
    coordinator: NegotiationCoordinator,
    max_subscriptions: usize,
    state: Mutex<SchedulerState>,
    connection: Mutex<SubscriberConnection>,
}

impl SubscriptionScheduler {
    pub fn new(
        control: Arc<dyn ControlChannel>,
        factory: Arc<dyn PeerFactory>,
        registry: Arc<Mutex<FeedRegistry>>,
        coordinator: NegotiationCoordinator,
        max_subscriptions: usize,
        track_sender: mpsc::UnboundedSender<TrackEvent>,
    ) -> Self {
        Self {
            control,
            factory,
            registry,
            track_sender,
            coordinator,
            max_subscriptions,
            state: Mutex::new(SchedulerState::default()),
            connection: Mutex::new(SubscriberConnection::default()),
        }
    }

    /// Records the room membership needed to join as a subscriber.
    pub async fn set_membership(
        &self,
        room: RoomId,
        local_feed: Option<FeedId>,
        private_id: Option<u64>,
    ) {
        let mut state = self.state.lock().await;
        state.room = Some(room);
        if local_feed.is_some() {
            state.local_feed = local_feed;
        }
        if private_id.is_some() {
            state.private_id = private_id;
        }
    }

    pub async fn subscriptions(&self) -> Vec<FeedId> {
        self.state.lock().await.subscribed.iter().cloned().collect()
    }

    pub async fn is_subscribed(&self, id: &FeedId) -> bool {
        self.state.lock().await.subscribed.contains(id)
    }

    pub fn max_subscriptions(&self) -> usize {
        self.max_subscriptions
    }

    /// Single entry point for registry changes. Removed feeds are
    /// unsubscribed first, then feeds are subscribed in arrival order until
    /// the limit is reached: `added` first, then every other known feed that
    /// is still waiting.
    pub async fn on_feeds_changed(&self, added: &[FeedId], removed: &[FeedId]) -> ScheduleReport {
        let mut report = ScheduleReport::default();

        for id in removed {
            let was_subscribed = {
                let mut state = self.state.lock().await;
                if state.in_flight.contains(id) {
                    state.cancelled.insert(id.clone());
                }
                state.skipped.remove(id);
                state.subscribed.contains(id)
            };
            if !was_subscribed {
                continue;
            }
            if let Err(err) = self
                .update(vec![], vec![StreamRef::feed(id.clone())])
                .await
            {
                tracing::error!("failed to unsubscribe removed feed {}: {}", id, err);
                report.failed.push((id.clone(), Arc::new(err)));
            }
            self.state.lock().await.subscribed.shift_remove(id);
            report.unsubscribed.push(id.clone());
        }

        {
            let mut state = self.state.lock().await;
            for id in added {
                state.skipped.remove(id);
            }
        }

        let known = self.registry.lock().await.ids();
        let mut candidates: Vec<FeedId> = added.to_vec();
        {
            let state = self.state.lock().await;
            for id in known {
                if !candidates.contains(&id) && !state.skipped.contains(&id) {
                    candidates.push(id);
                }
            }
        }

        for id in candidates {
            {
                let state = self.state.lock().await;
                if state.closed {
                    tracing::debug!("subscriber connection closed, scheduling stopped");
                    break;
                }
                if state.local_feed.as_ref() == Some(&id)
                    || state.subscribed.contains(&id)
                    || state.in_flight.contains(&id)
                {
                    continue;
                }
                if state.subscribed.len() + state.in_flight.len() >= self.max_subscriptions {
                    report.pending.push(id);
                    continue;
                }
            }

            match self.subscribe_feed(&id).await {
                Ok(true) => report.subscribed.push(id),
                Ok(false) => {}
                Err(Error::SessionError(e)) => match e.kind {
                    SessionErrorKind::NoStreamsError => {
                        tracing::warn!("feed {} has no subscribable streams", id);
                        self.state.lock().await.skipped.insert(id.clone());
                        report.skipped.push(id);
                    }
                    SessionErrorKind::SubscriptionLimitError => report.pending.push(id),
                    _ => tracing::debug!("feed {} not subscribed: {}", id, e),
                },
                Err(err) => {
                    tracing::error!("failed to subscribe feed {}: {}", id, err);
                    report.failed.push((id, Arc::new(err)));
                }
            }
        }

        if !report.pending.is_empty() {
            tracing::info!(
                "subscription limit {} reached, {} feeds pending",
                self.max_subscriptions,
                report.pending.len()
            );
        }
        report
    }

    /// Subscribes to one feed. Already subscribed feeds are a no-op.
    pub async fn subscribe(&self, id: &FeedId) -> Result<(), Error> {
        self.subscribe_feed(id).await.map(|_| ())
    }

    /// Unsubscribes from one feed. Feeds outside the subscription set are a no-op.
    pub async fn unsubscribe(&self, id: &FeedId) -> Result<(), Error> {
        if !self.is_subscribed(id).await {
            return Ok(());
        }
        self.update(vec![], vec![StreamRef::feed(id.clone())])
            .await?;
        self.state.lock().await.subscribed.shift_remove(id);
        tracing::info!("unsubscribed from feed {}", id);
        Ok(())
    }

    async fn subscribe_feed(&self, id: &FeedId) -> Result<bool, Error> {
        let streams: Vec<StreamRef> = {
            let registry = self.registry.lock().await;
            let feed = registry.get(id).ok_or_else(|| {
                Error::new_session(
                    format!("Feed {} is not known", id),
                    SessionErrorKind::FeedNotFoundError,
                )
            })?;
            feed.streams
                .iter()
                .map(|s| StreamRef::stream(id.clone(), s.mid.clone()))
                .collect()
        };
        if streams.is_empty() {
            return Err(Error::new_session(
                format!("Feed {} has no subscribable streams", id),
                SessionErrorKind::NoStreamsError,
            ));
        }

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(closed_error());
            }
            if state.local_feed.as_ref() == Some(id) {
                return Err(Error::new_session(
                    format!("Feed {} is the local feed", id),
                    SessionErrorKind::SelfSubscriptionError,
                ));
            }
            if state.subscribed.contains(id) || state.in_flight.contains(id) {
                return Ok(false);
            }
            if state.subscribed.len() + state.in_flight.len() >= self.max_subscriptions {
                return Err(Error::new_session(
                    format!(
                        "Subscription limit {} reached, feed {} not subscribed",
                        self.max_subscriptions, id
                    ),
                    SessionErrorKind::SubscriptionLimitError,
                ));
            }
            state.in_flight.insert(id.clone());
        }

        let result = self.update(streams, vec![]).await;

        let still_known = self.registry.lock().await.contains(id);
        let mut state = self.state.lock().await;
        state.in_flight.remove(id);
        let cancelled = state.cancelled.remove(id);
        if state.closed {
            tracing::debug!("feed {} subscribed during teardown, discarding", id);
            return Ok(false);
        }
        result?;

        if cancelled || !still_known {
            drop(state);
            tracing::debug!("feed {} left while subscribing, discarding", id);
            if let Err(err) = self
                .update(vec![], vec![StreamRef::feed(id.clone())])
                .await
            {
                tracing::warn!("failed to clean up subscription of feed {}: {}", id, err);
            }
            return Ok(false);
        }

        state.subscribed.insert(id.clone());
        tracing::info!("subscribed to feed {}", id);
        Ok(true)
    }

    /// Applies one subscribe/unsubscribe change on the shared connection.
    /// Concurrent callers wait for the in-flight renegotiation to finish.
    async fn update(
        &self,
        subscribe: Vec<StreamRef>,
        unsubscribe: Vec<StreamRef>,
    ) -> Result<(), Error> {
        let mut connection = self.connection.lock().await;
        if self.state.lock().await.closed {
            return Err(closed_error());
        }

        let response = if connection.joined {
            self.control
                .send(
                    Role::Subscriber,
                    Request::Update {
                        subscribe,
                        unsubscribe,
                    },
                )
                .await?
                .into_result()?
        } else {
            if subscribe.is_empty() {
                return Ok(());
            }
            let (room, private_id) = {
                let state = self.state.lock().await;
                (state.room.clone(), state.private_id)
            };
            let room = room.ok_or_else(|| {
                Error::new_session(
                    "Not joined to a room".to_owned(),
                    SessionErrorKind::InvalidStateError,
                )
            })?;
            if !connection.attached {
                self.control.attach(Role::Subscriber).await?;
                connection.attached = true;
            }
            let response = self
                .control
                .send(
                    Role::Subscriber,
                    Request::JoinSubscriber {
                        room,
                        streams: subscribe,
                        private_id,
                    },
                )
                .await?
                .into_result()?;
            connection.joined = true;
            response
        };

        if let Some(offer) = response.jsep {
            self.answer(&mut connection, &offer).await?;
        }
        Ok(())
    }

    /// Answers an offer the backend pushed outside of a request.
    pub async fn handle_remote_offer(&self, offer: &Jsep) -> Result<(), Error> {
        let mut connection = self.connection.lock().await;
        if self.state.lock().await.closed {
            tracing::debug!("remote offer after teardown dropped");
            return Ok(());
        }
        self.answer(&mut connection, offer).await
    }

    async fn answer(&self, connection: &mut SubscriberConnection, offer: &Jsep) -> Result<(), Error> {
        let peer = match &connection.peer {
            Some(peer) => Arc::clone(peer),
            None => {
                let peer = self
                    .factory
                    .create_peer(Role::Subscriber, self.track_sender.clone())
                    .await?;
                connection.peer = Some(Arc::clone(&peer));
                peer
            }
        };
        let answer = self
            .coordinator
            .apply_remote_offer(peer.as_ref(), offer, &RECV_TRACKS)
            .await?;
        self.control
            .send(Role::Subscriber, Request::Start { answer })
            .await?
            .into_result()?;
        Ok(())
    }

    /// Closes the subscriber peer and detaches its handle. Every step runs
    /// even if an earlier one fails; failures are returned for logging.
    /// Scheduling work still running afterwards acquires nothing.
    pub async fn teardown(&self) -> Vec<Error> {
        let mut errors = vec![];
        let mut connection = self.connection.lock().await;
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.subscribed.clear();
            state.in_flight.clear();
            state.cancelled.clear();
            state.skipped.clear();
        }

        if let Some(peer) = connection.peer.take() {
            if let Err(err) = peer.close().await {
                errors.push(err);
            }
        }
        if connection.attached {
            connection.attached = false;
            connection.joined = false;
            if let Err(err) = self.control.detach(Role::Subscriber).await {
                errors.push(err);
            }
        }
        errors
    }
}

fn closed_error() -> Error {
    Error::new_session(
        "Subscriber connection is closed".to_owned(),
        SessionErrorKind::InvalidStateError,
    )
}
