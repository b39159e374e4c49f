use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use webrtc::{
    api::{media_engine::MediaEngine, APIBuilder},
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiver, RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::{
    config::{SessionConfig, WebRTCTransportConfig},
    error::{Error, TransportErrorKind},
    feed::MediaKind,
    media_engine,
    media_track::{LocalTrackSource, MediaTrack, RemoteTrackSource},
    message::{Jsep, JsepType, Role},
    negotiation::{NegotiationPeer, PeerFactory, TrackEvent, TrackSpec},
};

const STREAM_ID: &str = "videoroom-client";

struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
}

/// [`NegotiationPeer`] backed by a [`webrtc::peer_connection::RTCPeerConnection`].
/// ICE candidates are gathered before a description is returned, so no
/// trickle signaling is needed.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRTCTransport {
    pub id: String,
    pub role: Role,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
    track_sender: mpsc::UnboundedSender<TrackEvent>,
    #[derivative(Debug = "ignore")]
    local_tracks: Mutex<HashMap<MediaKind, LocalTrack>>,
}

impl WebRTCTransport {
    pub async fn new(
        role: Role,
        config: &WebRTCTransportConfig,
        track_sender: mpsc::UnboundedSender<TrackEvent>,
    ) -> Result<Arc<Self>, Error> {
        let id = Uuid::new_v4().to_string();
        let peer_connection = Self::generate_peer_connection(config).await?;

        let transport = Self {
            id,
            role,
            peer_connection: Arc::new(peer_connection),
            track_sender,
            local_tracks: Mutex::new(HashMap::new()),
        };
        transport.peer_hooks();

        tracing::debug!("WebRTCTransport {} ({:?}) is created", transport.id, role);

        Ok(Arc::new(transport))
    }

    async fn generate_peer_connection(
        config: &WebRTCTransportConfig,
    ) -> Result<RTCPeerConnection, Error> {
        let mut me = MediaEngine::default();
        media_engine::register_default_codecs(&mut me)?;
        media_engine::register_extensions(&mut me)?;
        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_setting_engine(config.setting_engine())
            .build();

        let peer_connection = api.new_peer_connection(config.configuration()).await?;
        Ok(peer_connection)
    }

    fn peer_hooks(&self) {
        let peer = self.peer_connection.clone();
        let id = self.id.clone();

        peer.on_peer_connection_state_change(Box::new(enc!((id) move |state| {
            Box::pin(enc!((id) async move {
                match state {
                    RTCPeerConnectionState::Failed => {
                        tracing::error!("WebRTCTransport {} peer connection failed", id)
                    }
                    _ => tracing::debug!("WebRTCTransport {} peer connection state: {}", id, state),
                }
            }))
        })));

        peer.on_ice_gathering_state_change(Box::new(move |state| {
            Box::pin(async move {
                tracing::trace!("ICE gathering state changed: {}", state);
            })
        }));

        let track_sender = self.track_sender.clone();
        peer.on_track(Box::new(enc!((track_sender)
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!((track_sender) async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    let mid = transceiver.mid().map(|mid| mid.to_string());
                    tracing::info!("on track: id={}, ssrc={}, mid={:?}", track.id(), track.ssrc(), mid);

                    let (source, ended) = RemoteTrackSource::new(track.clone());
                    let media_track = MediaTrack::new(track.id(), kind, source);
                    let _ = track_sender.send(TrackEvent {
                        mid: mid.clone(),
                        track: media_track.clone(),
                        present: true,
                    });

                    // The handler must return before the next track can be delivered.
                    tokio::spawn(async move {
                        let _ = ended.await;
                        let _ = track_sender.send(TrackEvent {
                            mid,
                            track: media_track,
                            present: false,
                        });
                    });
                }))
            }
        )));
    }

    async fn add_local_track(&self, spec: &TrackSpec) -> Result<(), Error> {
        let mut local_tracks = self.local_tracks.lock().await;
        if local_tracks.contains_key(&spec.kind) {
            return Ok(());
        }

        let capability = match spec.kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: media_engine::OPUS_FMTP.to_owned(),
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let track_id = Uuid::new_v4().to_string();
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            track_id.clone(),
            STREAM_ID.to_owned(),
        ));
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for interceptors to run.
        tokio::spawn(enc!((sender) async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        }));

        if spec.muted {
            sender.replace_track(None).await?;
        }

        let source = LocalTrackSource::new(track_id.clone(), track.clone(), sender.clone());
        let _ = self.track_sender.send(TrackEvent {
            mid: None,
            track: MediaTrack::new(track_id, spec.kind, source),
            present: true,
        });
        local_tracks.insert(spec.kind, LocalTrack { track, sender });
        Ok(())
    }

    async fn add_receiver(&self, kind: MediaKind) -> Result<(), Error> {
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        self.peer_connection
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn local_description(&self) -> Result<RTCSessionDescription, Error> {
        match self.peer_connection.local_description().await {
            Some(description) => Ok(description),
            None => Err(Error::new_transport(
                "Failed to set local description".to_string(),
                TransportErrorKind::LocalDescriptionError,
            )),
        }
    }

    fn to_description(jsep: &Jsep) -> Result<RTCSessionDescription, Error> {
        let description = match jsep.kind {
            JsepType::Offer => RTCSessionDescription::offer(jsep.sdp.clone())?,
            JsepType::Answer => RTCSessionDescription::answer(jsep.sdp.clone())?,
        };
        Ok(description)
    }
}

#[async_trait]
impl NegotiationPeer for WebRTCTransport {
    async fn create_offer(&self, tracks: &[TrackSpec]) -> Result<Jsep, Error> {
        for spec in tracks {
            if spec.capture {
                self.add_local_track(spec).await?;
            } else if spec.recv {
                self.add_receiver(spec.kind).await?;
            }
        }

        tracing::debug!("WebRTCTransport {} creates offer", self.id);
        let offer = self.peer_connection.create_offer(None).await?;
        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(offer).await?;
        let _ = gathering_complete.recv().await;

        let description = self.local_description().await?;
        Ok(Jsep::offer(description.sdp))
    }

    async fn create_answer(&self, remote: &Jsep, tracks: &[TrackSpec]) -> Result<Jsep, Error> {
        tracing::debug!("WebRTCTransport {} set remote offer", self.id);
        self.peer_connection
            .set_remote_description(Self::to_description(remote)?)
            .await?;

        for spec in tracks.iter().filter(|spec| spec.capture) {
            self.add_local_track(spec).await?;
        }

        let answer = self.peer_connection.create_answer(None).await?;
        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(answer).await?;
        let _ = gathering_complete.recv().await;

        let description = self.local_description().await?;
        Ok(Jsep::answer(description.sdp))
    }

    async fn apply_remote(&self, jsep: &Jsep) -> Result<(), Error> {
        tracing::debug!("WebRTCTransport {} set remote {:?}", self.id, jsep.kind);
        self.peer_connection
            .set_remote_description(Self::to_description(jsep)?)
            .await?;
        Ok(())
    }

    async fn set_muted(&self, kind: MediaKind, muted: bool) -> Result<(), Error> {
        let local_tracks = self.local_tracks.lock().await;
        let Some(local) = local_tracks.get(&kind) else {
            return Ok(());
        };
        let track = if muted {
            None
        } else {
            Some(Arc::clone(&local.track) as Arc<dyn TrackLocal + Send + Sync>)
        };
        local.sender.replace_track(track).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.local_tracks.lock().await.clear();
        self.peer_connection.close().await?;
        tracing::debug!("WebRTCTransport {} is closed", self.id);
        Ok(())
    }
}

impl Drop for WebRTCTransport {
    fn drop(&mut self) {
        tracing::debug!("WebRTCTransport {} is dropped", self.id);
    }
}

/// Creates one [`WebRTCTransport`] per connection role. The ICE servers of
/// the session config are applied on connect.
#[derive(Debug, Default)]
pub struct WebRTCTransportFactory {
    config: Mutex<WebRTCTransportConfig>,
}

impl WebRTCTransportFactory {
    pub fn new(config: WebRTCTransportConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    pub async fn config(&self) -> WebRTCTransportConfig {
        self.config.lock().await.clone()
    }
}

#[async_trait]
impl PeerFactory for WebRTCTransportFactory {
    async fn create_peer(
        &self,
        role: Role,
        tracks: mpsc::UnboundedSender<TrackEvent>,
    ) -> Result<Arc<dyn NegotiationPeer>, Error> {
        let config = self.config().await;
        let transport = WebRTCTransport::new(role, &config, tracks).await?;
        Ok(transport as Arc<dyn NegotiationPeer>)
    }

    async fn configure(&self, config: &SessionConfig) {
        self.config
            .lock()
            .await
            .apply_ice_servers(&config.ice_servers);
    }
}
