use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{broadcast, mpsc, oneshot};
use webrtc::{
    rtp::packet::Packet,
    rtp_transceiver::rtp_sender::RTCRtpSender,
    track::{
        track_local::track_local_static_sample::TrackLocalStaticSample,
        track_remote::TrackRemote,
    },
};

use crate::feed::MediaKind;

/// The media resource behind a [`MediaTrack`]. `stop` releases it.
pub trait TrackSource: Send + Sync + fmt::Debug {
    fn stop(&self);
}

/// Handle of a local or remote media track. Clones share the underlying
/// resource, which is released at most once.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    #[derivative(Debug = "ignore")]
    source: Arc<dyn TrackSource>,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, source: Arc<dyn TrackSource>) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Releases the underlying resource. Returns false when it was already released.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!("MediaTrack {} ({}) is stopped", self.id, self.kind);
        self.source.stop();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> Arc<dyn TrackSource> {
        Arc::clone(&self.source)
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

/// Remote track received on the subscriber connection. RTP packets are
/// re-broadcast to whoever renders the track.
///
/// The receiver returned by [`RemoteTrackSource::new`] resolves when the
/// track stops delivering media.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RemoteTrackSource {
    pub id: String,
    #[derivative(Debug = "ignore")]
    pub track: Arc<TrackRemote>,
    #[derivative(Debug = "ignore")]
    rtp_sender: broadcast::Sender<Packet>,
    closed_sender: mpsc::UnboundedSender<()>,
}

impl RemoteTrackSource {
    pub fn new(track: Arc<TrackRemote>) -> (Arc<Self>, oneshot::Receiver<()>) {
        let id = track.id();
        let (rtp_sender, _) = broadcast::channel(1024);
        let (closed_sender, closed_receiver) = mpsc::unbounded_channel();
        let (ended_sender, ended_receiver) = oneshot::channel();

        tokio::spawn(enc!((track, rtp_sender) async move {
            Self::rtp_event_loop(track, rtp_sender, closed_receiver).await;
            let _ = ended_sender.send(());
        }));

        let source = Arc::new(Self {
            id,
            track,
            rtp_sender,
            closed_sender,
        });
        (source, ended_receiver)
    }

    pub fn subscribe_rtp(&self) -> broadcast::Receiver<Packet> {
        self.rtp_sender.subscribe()
    }

    async fn rtp_event_loop(
        track: Arc<TrackRemote>,
        rtp_sender: broadcast::Sender<Packet>,
        mut closed_receiver: mpsc::UnboundedReceiver<()>,
    ) {
        let track_id = track.id();
        tracing::debug!(
            "RemoteTrack RTP event loop has started for {}, {}: {}",
            track_id,
            track.payload_type(),
            track.codec().capability.mime_type
        );

        loop {
            tokio::select! {
                _closed = closed_receiver.recv() => {
                    break;
                }
                res = track.read_rtp() => {
                    match res {
                        Ok((rtp, _attr)) => {
                            tracing::trace!(
                                "RemoteTrack {} received RTP ssrc={} seq={}",
                                track_id,
                                rtp.header.ssrc,
                                rtp.header.sequence_number
                            );
                            if rtp_sender.receiver_count() > 0 {
                                let _ = rtp_sender.send(rtp);
                            }
                        }
                        Err(err) => {
                            tracing::debug!("RemoteTrack {} finished reading rtp: {}", track_id, err);
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!("RemoteTrack RTP event loop has finished for {}", track_id);
    }
}

impl TrackSource for RemoteTrackSource {
    fn stop(&self) {
        let _ = self.closed_sender.send(());
    }
}

/// Captured track sent on the publisher connection. Samples are written by
/// the application through `track`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct LocalTrackSource {
    pub id: String,
    #[derivative(Debug = "ignore")]
    pub track: Arc<TrackLocalStaticSample>,
    #[derivative(Debug = "ignore")]
    rtp_sender: Arc<RTCRtpSender>,
}

impl LocalTrackSource {
    pub fn new(
        id: String,
        track: Arc<TrackLocalStaticSample>,
        rtp_sender: Arc<RTCRtpSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            track,
            rtp_sender,
        })
    }

    pub fn rtp_sender(&self) -> Arc<RTCRtpSender> {
        Arc::clone(&self.rtp_sender)
    }
}

impl TrackSource for LocalTrackSource {
    fn stop(&self) {
        let sender = Arc::clone(&self.rtp_sender);
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(err) = sender.stop().await {
                tracing::warn!("failed to stop local track {}: {}", id, err);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Debug, Default)]
    struct CountingSource {
        stops: AtomicUsize,
    }

    impl TrackSource for CountingSource {
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_releases_once() {
        let source = Arc::new(CountingSource::default());
        let track = MediaTrack::new("t1", MediaKind::Audio, source.clone());
        let clone = track.clone();
        assert!(track.stop());
        assert!(!clone.stop());
        assert!(clone.is_stopped());
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    }
}
