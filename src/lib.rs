#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # videoroom-client
//! Client core for multi-party video rooms. A [`session::Session`] joins a room through a
//! signaling backend, publishes local media and subscribes to the feeds of other participants,
//! keeping the number of simultaneous subscriptions under a configured limit.
//!
//! The signaling transport is not part of this crate. Implement [`message::ControlChannel`]
//! for your backend connection, and use [`transport::WebRTCTransportFactory`] or your own
//! [`negotiation::PeerFactory`] for media.

/// Configuration for [`session::Session`] and [`transport::WebRTCTransport`].
pub mod config;
/// Routing of remote tracks to the feeds that own them.
pub mod demux;
pub mod error;
pub mod feed;
pub mod media_engine;
pub mod media_track;
/// Requests, responses and events of the signaling backend.
pub mod message;
pub mod negotiation;
/// Publisher handle: join, publish, mute and leave.
pub mod publisher;
pub mod registry;
pub mod session;
/// Subscriber handle and the subscription scheduler.
pub mod subscriber;
/// [`webrtc::peer_connection::RTCPeerConnection`] backed negotiation peers.
pub mod transport;

#[cfg(test)]
mod test_util;
