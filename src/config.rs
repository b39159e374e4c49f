use std::{net::IpAddr, sync::Arc, time::Duration};

use derivative::Derivative;
use serde::Deserialize;
use webrtc::{
    api::setting_engine::SettingEngine,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::configuration::RTCConfiguration,
};
use webrtc_ice::network_type::NetworkType;

use crate::{
    error::{Error, SessionErrorKind},
    message::RoomId,
};

const DEFAULT_MAX_CONCURRENT_SUBSCRIPTIONS: usize = 12;
const DEFAULT_BITRATE: u64 = 512_000;

/// Settings recognized when a [`crate::session::Session`] connects.
#[derive(Derivative, Clone, Deserialize)]
#[derivative(Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub server: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    #[derivative(Debug = "ignore")]
    pub token: Option<String>,
    #[serde(default)]
    #[derivative(Debug = "ignore")]
    pub api_secret: Option<String>,
    #[serde(default = "default_max_concurrent_subscriptions")]
    pub max_concurrent_subscriptions: usize,
    #[serde(default)]
    pub stereo: bool,
    #[serde(default = "default_bitrate")]
    pub bitrate: u64,
    #[serde(default)]
    pub room: Option<RoomId>,
}

fn default_max_concurrent_subscriptions() -> usize {
    DEFAULT_MAX_CONCURRENT_SUBSCRIPTIONS
}

fn default_bitrate() -> u64 {
    DEFAULT_BITRATE
}

impl SessionConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ice_servers: vec![],
            token: None,
            api_secret: None,
            max_concurrent_subscriptions: DEFAULT_MAX_CONCURRENT_SUBSCRIPTIONS,
            stereo: false,
            bitrate: DEFAULT_BITRATE,
            room: None,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.server.trim().is_empty() {
            return Err(Error::new_session(
                "server url is required".to_owned(),
                SessionErrorKind::InvalidConfigError,
            ));
        }
        if self.max_concurrent_subscriptions == 0 {
            return Err(Error::new_session(
                "maxConcurrentSubscriptions must be greater than zero".to_owned(),
                SessionErrorKind::InvalidConfigError,
            ));
        }
        Ok(())
    }
}

#[derive(Derivative, Clone, Deserialize, PartialEq, Eq)]
#[derivative(Debug)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    #[derivative(Debug = "ignore")]
    pub credential: Option<String>,
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Configuration for [`crate::transport::WebRTCTransport`].
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct WebRTCTransportConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
    pub announced_ips: Vec<IpAddr>,
    pub ice_disconnected_timeout: Option<Duration>,
    pub ice_failed_timeout: Option<Duration>,
    pub ice_keep_alive_interval: Option<Duration>,
    pub network_types: Vec<NetworkType>,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration {
                ..Default::default()
            },
            announced_ips: vec![],
            ice_disconnected_timeout: None,
            ice_failed_timeout: None,
            ice_keep_alive_interval: None,
            network_types: vec![],
        }
    }
}

impl From<&SessionConfig> for WebRTCTransportConfig {
    fn from(config: &SessionConfig) -> Self {
        let mut transport_config = Self::default();
        transport_config.apply_ice_servers(&config.ice_servers);
        transport_config
    }
}

impl WebRTCTransportConfig {
    /// Replaces the ICE servers. An empty list keeps the current ones.
    pub fn apply_ice_servers(&mut self, ice_servers: &[IceServer]) {
        if ice_servers.is_empty() {
            return;
        }
        self.configuration.ice_servers = ice_servers.iter().map(RTCIceServer::from).collect();
    }

    pub fn configuration(&self) -> RTCConfiguration {
        self.configuration.clone()
    }

    pub(crate) fn setting_engine(&self) -> SettingEngine {
        let mut setting_engine = SettingEngine::default();

        if self.ice_disconnected_timeout.is_some()
            || self.ice_failed_timeout.is_some()
            || self.ice_keep_alive_interval.is_some()
        {
            setting_engine.set_ice_timeouts(
                self.ice_disconnected_timeout,
                self.ice_failed_timeout,
                self.ice_keep_alive_interval,
            );
        }

        if !self.announced_ips.is_empty() {
            let announced_ips = Arc::new(self.announced_ips.clone());
            setting_engine.set_ip_filter(Box::new(move |ip| announced_ips.contains(&ip)));
        }

        if !self.network_types.is_empty() {
            setting_engine.set_network_types(self.network_types.clone());
        }

        setting_engine
    }
}
