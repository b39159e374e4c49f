use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{
    config::SessionConfig,
    demux::MediaSink,
    error::{Error, TransportErrorKind},
    feed::{FeedId, MediaKind},
    media_track::{MediaTrack, TrackSource},
    message::{ControlChannel, ControlEvent, Jsep, Request, Response, Role},
    negotiation::{NegotiationPeer, PeerFactory, TrackEvent, TrackSpec},
};

pub(crate) const MOCK_OFFER: &str = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=fmtp:111 minptime=10;useinbandfec=1\r\n";

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
pub(crate) struct StopCounter {
    stops: AtomicUsize,
}

impl StopCounter {
    pub fn count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl TrackSource for StopCounter {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn test_track(id: &str, kind: MediaKind) -> (MediaTrack, Arc<StopCounter>) {
    let counter = Arc::new(StopCounter::default());
    (MediaTrack::new(id, kind, counter.clone()), counter)
}

#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    presented: Mutex<Vec<(FeedId, MediaKind)>>,
    cleared: Mutex<Vec<(FeedId, MediaKind)>>,
}

impl RecordingSink {
    pub fn presented(&self) -> Vec<(FeedId, MediaKind)> {
        self.presented.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> Vec<(FeedId, MediaKind)> {
        self.cleared.lock().unwrap().clone()
    }
}

impl MediaSink for RecordingSink {
    fn present(&self, feed: &FeedId, kind: MediaKind, _track: &MediaTrack) {
        self.presented.lock().unwrap().push((feed.clone(), kind));
    }

    fn clear(&self, feed: &FeedId, kind: MediaKind) {
        self.cleared.lock().unwrap().push((feed.clone(), kind));
    }
}

#[derive(Debug)]
pub(crate) struct MockPeer {
    offer_sdp: String,
    fail_answer: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    muted: Mutex<Vec<(MediaKind, bool)>>,
    offers: Mutex<Vec<Vec<TrackSpec>>>,
    remote: Mutex<Vec<Jsep>>,
}

impl Default for MockPeer {
    fn default() -> Self {
        Self::with_offer_sdp(MOCK_OFFER)
    }
}

impl MockPeer {
    pub fn with_offer_sdp(sdp: &str) -> Self {
        Self {
            offer_sdp: sdp.to_owned(),
            fail_answer: Arc::new(AtomicBool::new(false)),
            closes: Arc::new(AtomicUsize::new(0)),
            muted: Mutex::new(vec![]),
            offers: Mutex::new(vec![]),
            remote: Mutex::new(vec![]),
        }
    }

    fn shared(fail_answer: Arc<AtomicBool>, closes: Arc<AtomicUsize>) -> Self {
        Self {
            fail_answer,
            closes,
            ..Self::default()
        }
    }

    pub fn fail_next_answer(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    pub fn muted(&self) -> Vec<(MediaKind, bool)> {
        self.muted.lock().unwrap().clone()
    }

    pub fn offers(&self) -> Vec<Vec<TrackSpec>> {
        self.offers.lock().unwrap().clone()
    }

    pub fn remote(&self) -> Vec<Jsep> {
        self.remote.lock().unwrap().clone()
    }
}

#[async_trait]
impl NegotiationPeer for MockPeer {
    async fn create_offer(&self, tracks: &[TrackSpec]) -> Result<Jsep, Error> {
        self.offers.lock().unwrap().push(tracks.to_vec());
        Ok(Jsep::offer(self.offer_sdp.clone()))
    }

    async fn create_answer(&self, remote: &Jsep, _tracks: &[TrackSpec]) -> Result<Jsep, Error> {
        if self.fail_answer.swap(false, Ordering::SeqCst) {
            return Err(Error::new_transport(
                "mock answer failure".to_owned(),
                TransportErrorKind::PeerConnectionError,
            ));
        }
        self.remote.lock().unwrap().push(remote.clone());
        Ok(Jsep::answer("v=0\r\n"))
    }

    async fn apply_remote(&self, jsep: &Jsep) -> Result<(), Error> {
        self.remote.lock().unwrap().push(jsep.clone());
        Ok(())
    }

    async fn set_muted(&self, kind: MediaKind, muted: bool) -> Result<(), Error> {
        self.muted.lock().unwrap().push((kind, muted));
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockFactory {
    fail_answer: Arc<AtomicBool>,
    created: Mutex<HashMap<Role, usize>>,
    closes: Mutex<HashMap<Role, Arc<AtomicUsize>>>,
    peers: Mutex<HashMap<Role, Arc<MockPeer>>>,
    senders: Mutex<HashMap<Role, mpsc::UnboundedSender<TrackEvent>>>,
    configured: Mutex<Vec<usize>>,
}

impl MockFactory {
    /// The next answer of any peer fails once.
    pub fn fail_next_answer(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    pub fn created(&self, role: Role) -> usize {
        self.created.lock().unwrap().get(&role).copied().unwrap_or(0)
    }

    pub fn closed(&self, role: Role) -> usize {
        self.closes
            .lock()
            .unwrap()
            .get(&role)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn peer(&self, role: Role) -> Option<Arc<MockPeer>> {
        self.peers.lock().unwrap().get(&role).cloned()
    }

    pub fn track_sender(&self, role: Role) -> Option<mpsc::UnboundedSender<TrackEvent>> {
        self.senders.lock().unwrap().get(&role).cloned()
    }

    /// ICE server count of every `configure` call.
    pub fn configured(&self) -> Vec<usize> {
        self.configured.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerFactory for MockFactory {
    async fn create_peer(
        &self,
        role: Role,
        tracks: mpsc::UnboundedSender<TrackEvent>,
    ) -> Result<Arc<dyn NegotiationPeer>, Error> {
        *self.created.lock().unwrap().entry(role).or_default() += 1;
        let closes = self
            .closes
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .clone();
        let peer = Arc::new(MockPeer::shared(self.fail_answer.clone(), closes));
        self.peers.lock().unwrap().insert(role, peer.clone());
        self.senders.lock().unwrap().insert(role, tracks);
        Ok(peer as Arc<dyn NegotiationPeer>)
    }

    async fn configure(&self, config: &SessionConfig) {
        self.configured.lock().unwrap().push(config.ice_servers.len());
    }
}

#[derive(Debug, Default)]
struct Counters {
    attach: HashMap<Role, usize>,
    detach: HashMap<Role, usize>,
    sending: HashMap<Role, usize>,
    max_sending: HashMap<Role, usize>,
    destroy: usize,
    create_session: usize,
}

/// Scripted control channel. Every request succeeds with a plausible
/// videoroom reply unless overridden with `respond` or `fail_next`.
#[derive(Debug)]
pub(crate) struct MockControl {
    requests: Mutex<Vec<(Role, Request)>>,
    responses: Mutex<HashMap<&'static str, Response>>,
    failures: Mutex<Vec<&'static str>>,
    counters: Mutex<Counters>,
    delay: Mutex<Option<Duration>>,
    fail_create_session: AtomicBool,
    event_sender: mpsc::UnboundedSender<ControlEvent>,
    event_receiver: Mutex<Option<mpsc::UnboundedReceiver<ControlEvent>>>,
}

impl Default for MockControl {
    fn default() -> Self {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        Self {
            requests: Mutex::new(vec![]),
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(vec![]),
            counters: Mutex::new(Counters::default()),
            delay: Mutex::new(None),
            fail_create_session: AtomicBool::new(false),
            event_sender,
            event_receiver: Mutex::new(Some(event_receiver)),
        }
    }
}

impl MockControl {
    /// The next request named `name` gets `response`.
    pub fn respond(&self, name: &'static str, response: Response) {
        self.responses.lock().unwrap().insert(name, response);
    }

    /// The next request named `name` is rejected.
    pub fn fail_next(&self, name: &'static str) {
        self.failures.lock().unwrap().push(name);
    }

    pub fn fail_create_session(&self) {
        self.fail_create_session.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn emit(&self, role: Role, data: Value, jsep: Option<Jsep>) {
        let _ = self.event_sender.send(ControlEvent { role, data, jsep });
    }

    pub fn requests(&self, role: Role) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn count(&self, role: Role, name: &str) -> usize {
        self.requests(role)
            .iter()
            .filter(|r| r.name() == name)
            .count()
    }

    pub fn attach_count(&self, role: Role) -> usize {
        self.counters.lock().unwrap().attach.get(&role).copied().unwrap_or(0)
    }

    pub fn detach_count(&self, role: Role) -> usize {
        self.counters.lock().unwrap().detach.get(&role).copied().unwrap_or(0)
    }

    pub fn destroy_count(&self) -> usize {
        self.counters.lock().unwrap().destroy
    }

    pub fn create_session_count(&self) -> usize {
        self.counters.lock().unwrap().create_session
    }

    pub fn max_concurrent_sends(&self, role: Role) -> usize {
        self.counters
            .lock()
            .unwrap()
            .max_sending
            .get(&role)
            .copied()
            .unwrap_or(0)
    }

    fn default_response(request: &Request) -> Response {
        match request {
            Request::JoinPublisher { room, .. } => Response::new(
                json!({"videoroom": "joined", "room": room, "id": 1, "private_id": 99, "publishers": []}),
                None,
            ),
            Request::JoinSubscriber { .. } => Response::new(
                json!({"videoroom": "attached"}),
                Some(Jsep::offer(MOCK_OFFER)),
            ),
            Request::Update { subscribe, .. } if !subscribe.is_empty() => Response::new(
                json!({"videoroom": "updated"}),
                Some(Jsep::offer(MOCK_OFFER)),
            ),
            Request::Publish { .. } => Response::new(
                json!({"videoroom": "event", "configured": "ok"}),
                Some(Jsep::answer("v=0\r\n")),
            ),
            Request::ListParticipants { room } => Response::new(
                json!({"videoroom": "participants", "room": room, "participants": []}),
                None,
            ),
            _ => Response::new(json!({"videoroom": "event"}), None),
        }
    }

    fn take_failure(&self, name: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.iter().position(|f| *f == name) {
            Some(index) => {
                failures.remove(index);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ControlChannel for MockControl {
    async fn create_session(&self, _config: &SessionConfig) -> Result<(), Error> {
        self.counters.lock().unwrap().create_session += 1;
        if self.fail_create_session.swap(false, Ordering::SeqCst) {
            return Err(Error::new_transport(
                "mock server unreachable".to_owned(),
                TransportErrorKind::ConnectionError,
            ));
        }
        Ok(())
    }

    async fn attach(&self, role: Role) -> Result<(), Error> {
        *self.counters.lock().unwrap().attach.entry(role).or_default() += 1;
        Ok(())
    }

    async fn send(&self, role: Role, request: Request) -> Result<Response, Error> {
        self.requests.lock().unwrap().push((role, request.clone()));
        {
            let mut counters = self.counters.lock().unwrap();
            let sending = {
                let sending = counters.sending.entry(role).or_default();
                *sending += 1;
                *sending
            };
            let max = counters.max_sending.entry(role).or_default();
            *max = (*max).max(sending);
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        *self.counters.lock().unwrap().sending.entry(role).or_default() -= 1;

        if self.take_failure(request.name()) {
            return Err(Error::new_transport(
                format!("mock {} rejected", request.name()),
                TransportErrorKind::RequestRejectedError,
            ));
        }
        let scripted = self.responses.lock().unwrap().remove(request.name());
        Ok(scripted.unwrap_or_else(|| Self::default_response(&request)))
    }

    async fn detach(&self, role: Role) -> Result<(), Error> {
        *self.counters.lock().unwrap().detach.entry(role).or_default() += 1;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Error> {
        self.counters.lock().unwrap().destroy += 1;
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ControlEvent>> {
        self.event_receiver.lock().unwrap().take()
    }
}
