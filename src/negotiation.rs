use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    config::SessionConfig,
    error::{Error, NegotiationErrorKind},
    feed::MediaKind,
    media_track::MediaTrack,
    message::{Jsep, JsepType, Role},
};

/// Media line requested from a negotiation peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSpec {
    pub kind: MediaKind,
    pub capture: bool,
    pub recv: bool,
    pub muted: bool,
}

impl TrackSpec {
    pub fn send(kind: MediaKind) -> Self {
        Self {
            kind,
            capture: true,
            recv: false,
            muted: false,
        }
    }

    pub fn recv(kind: MediaKind) -> Self {
        Self {
            kind,
            capture: false,
            recv: true,
            muted: false,
        }
    }
}

/// A track appearing on (`present`) or leaving a connection. `mid` is the
/// media line the track was negotiated on.
#[derive(Debug, Clone)]
pub struct TrackEvent {
    pub mid: Option<String>,
    pub track: MediaTrack,
    pub present: bool,
}

/// Offer/answer capability of one logical connection.
#[async_trait]
pub trait NegotiationPeer: Send + Sync {
    async fn create_offer(&self, tracks: &[TrackSpec]) -> Result<Jsep, Error>;

    /// Applies the remote offer and returns the local answer.
    async fn create_answer(&self, remote: &Jsep, tracks: &[TrackSpec]) -> Result<Jsep, Error>;

    async fn apply_remote(&self, jsep: &Jsep) -> Result<(), Error>;

    async fn set_muted(&self, _kind: MediaKind, _muted: bool) -> Result<(), Error> {
        Ok(())
    }

    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Called on every connect, before any peer of that connection exists.
    async fn configure(&self, _config: &SessionConfig) {}

    /// Track events of the new peer are delivered through `tracks`.
    async fn create_peer(
        &self,
        role: Role,
        tracks: mpsc::UnboundedSender<TrackEvent>,
    ) -> Result<Arc<dyn NegotiationPeer>, Error>;
}

/// Adds `stereo=1` to every `useinbandfec=1` fmtp parameter unless the SDP
/// already asks for stereo.
pub fn enable_stereo(sdp: &str) -> String {
    if sdp.contains("stereo=1") {
        return sdp.to_owned();
    }
    sdp.replace("useinbandfec=1", "useinbandfec=1;stereo=1")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiationCoordinator {
    stereo: bool,
}

impl NegotiationCoordinator {
    pub fn new(stereo: bool) -> Self {
        Self { stereo }
    }

    pub fn stereo(&self) -> bool {
        self.stereo
    }

    pub async fn prepare_local_offer(
        &self,
        peer: &dyn NegotiationPeer,
        tracks: &[TrackSpec],
    ) -> Result<Jsep, Error> {
        tracing::debug!("creating local offer for {} tracks", tracks.len());
        let offer = peer
            .create_offer(tracks)
            .await
            .map_err(|e| negotiation_error(e, NegotiationErrorKind::CreateOfferError))?;

        let sends_audio = tracks
            .iter()
            .any(|t| t.kind == MediaKind::Audio && t.capture);
        if self.stereo && sends_audio {
            return Ok(Jsep {
                sdp: enable_stereo(&offer.sdp),
                ..offer
            });
        }
        Ok(offer)
    }

    pub async fn apply_remote_offer(
        &self,
        peer: &dyn NegotiationPeer,
        offer: &Jsep,
        tracks: &[TrackSpec],
    ) -> Result<Jsep, Error> {
        if offer.kind != JsepType::Offer {
            return Err(Error::new_negotiation(
                "expected a remote offer".to_owned(),
                NegotiationErrorKind::RemoteDescriptionError,
            ));
        }
        tracing::debug!("answering remote offer");
        peer.create_answer(offer, tracks)
            .await
            .map_err(|e| negotiation_error(e, NegotiationErrorKind::CreateAnswerError))
    }

    pub async fn apply_remote_answer(
        &self,
        peer: &dyn NegotiationPeer,
        answer: &Jsep,
    ) -> Result<(), Error> {
        if answer.kind != JsepType::Answer {
            return Err(Error::new_negotiation(
                "expected a remote answer".to_owned(),
                NegotiationErrorKind::RemoteDescriptionError,
            ));
        }
        tracing::debug!("applying remote answer");
        peer.apply_remote(answer)
            .await
            .map_err(|e| negotiation_error(e, NegotiationErrorKind::RemoteDescriptionError))
    }
}

fn negotiation_error(err: Error, kind: NegotiationErrorKind) -> Error {
    match err {
        Error::NegotiationError(_) => err,
        other => Error::new_negotiation(other.to_string(), kind),
    }
}
