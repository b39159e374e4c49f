use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{
    config::SessionConfig,
    error::{Error, ProtocolErrorKind, ROOM_NOT_FOUND_CODE},
    feed::{Feed, FeedId, MediaKind, StreamDescriptor},
};

pub type RoomId = FeedId;

/// Backend handle a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepType {
    Offer,
    Answer,
}

/// Session description exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: JsepType,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One stream of a feed in a subscribe or unsubscribe list. Without `mid`
/// the whole feed is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRef {
    pub feed: FeedId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
}

impl StreamRef {
    pub fn stream(feed: FeedId, mid: String) -> Self {
        Self {
            feed,
            mid: Some(mid),
        }
    }

    pub fn feed(feed: FeedId) -> Self {
        Self { feed, mid: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    JoinPublisher {
        room: RoomId,
        display: String,
    },
    JoinSubscriber {
        room: RoomId,
        streams: Vec<StreamRef>,
        private_id: Option<u64>,
    },
    Publish {
        offer: Jsep,
        bitrate: Option<u64>,
        audio: bool,
        video: bool,
    },
    Unpublish,
    Update {
        subscribe: Vec<StreamRef>,
        unsubscribe: Vec<StreamRef>,
    },
    Start {
        answer: Jsep,
    },
    ListParticipants {
        room: RoomId,
    },
    Leave,
}

impl Request {
    /// Message body and optional session description as sent on the wire.
    pub fn to_message(&self) -> (Value, Option<Jsep>) {
        match self {
            Request::JoinPublisher { room, display } => (
                json!({"request": "join", "ptype": "publisher", "room": room, "display": display}),
                None,
            ),
            Request::JoinSubscriber {
                room,
                streams,
                private_id,
            } => {
                let mut body = json!({"request": "join", "ptype": "subscriber", "room": room, "streams": streams});
                if let Some(private_id) = private_id {
                    body["private_id"] = json!(private_id);
                }
                (body, None)
            }
            Request::Publish {
                offer,
                bitrate,
                audio,
                video,
            } => {
                let mut body = json!({"request": "publish", "audio": audio, "video": video});
                if let Some(bitrate) = bitrate {
                    body["bitrate"] = json!(bitrate);
                }
                (body, Some(offer.clone()))
            }
            Request::Unpublish => (json!({"request": "unpublish"}), None),
            Request::Update {
                subscribe,
                unsubscribe,
            } => {
                let mut body = json!({"request": "update"});
                if !subscribe.is_empty() {
                    body["subscribe"] = json!(subscribe);
                }
                if !unsubscribe.is_empty() {
                    body["unsubscribe"] = json!(unsubscribe);
                }
                (body, None)
            }
            Request::Start { answer } => (json!({"request": "start"}), Some(answer.clone())),
            Request::ListParticipants { room } => {
                (json!({"request": "listparticipants", "room": room}), None)
            }
            Request::Leave => (json!({"request": "leave"}), None),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::JoinPublisher { .. } | Request::JoinSubscriber { .. } => "join",
            Request::Publish { .. } => "publish",
            Request::Unpublish => "unpublish",
            Request::Update { .. } => "update",
            Request::Start { .. } => "start",
            Request::ListParticipants { .. } => "listparticipants",
            Request::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub data: Value,
    pub jsep: Option<Jsep>,
}

impl Response {
    pub fn new(data: Value, jsep: Option<Jsep>) -> Self {
        Self { data, jsep }
    }

    /// Turns a backend-reported error into a `ProtocolError`.
    pub fn into_result(self) -> Result<Self, Error> {
        match protocol_error(&self.data) {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Inbound message of the control channel, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEvent {
    pub role: Role,
    pub data: Value,
    pub jsep: Option<Jsep>,
}

/// Signaling connection to the room backend.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn create_session(&self, config: &SessionConfig) -> Result<(), Error>;

    async fn attach(&self, role: Role) -> Result<(), Error>;

    async fn send(&self, role: Role, request: Request) -> Result<Response, Error>;

    async fn detach(&self, role: Role) -> Result<(), Error>;

    async fn destroy(&self) -> Result<(), Error>;

    /// Inbound events of the current signaling session. Each session's
    /// stream can be taken once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ControlEvent>>;
}

/// Strictly typed form of an inbound signaling message.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Joined {
        room: Option<RoomId>,
        id: FeedId,
        private_id: Option<u64>,
        publishers: Vec<Feed>,
    },
    Publishers(Vec<Feed>),
    Participants(Vec<Feed>),
    FeedLeft(FeedId),
    Destroyed,
    SlowLink {
        uplink: bool,
        lost: u64,
    },
    Error {
        code: Option<i64>,
        message: String,
    },
}

impl RoomEvent {
    /// A single message may carry several events, e.g. new publishers and
    /// a leaving one.
    pub fn parse(data: &Value) -> Vec<RoomEvent> {
        let mut events = vec![];

        if data.get("janus").and_then(Value::as_str) == Some("slowlink") {
            events.push(RoomEvent::SlowLink {
                uplink: flag(&data["uplink"]).unwrap_or(false),
                lost: data["lost"].as_u64().unwrap_or(0),
            });
            return events;
        }

        if let Some(message) = data.get("error").and_then(Value::as_str) {
            events.push(RoomEvent::Error {
                code: data.get("error_code").and_then(Value::as_i64),
                message: message.to_owned(),
            });
        }

        match data.get("videoroom").and_then(Value::as_str) {
            Some("joined") => match FeedId::parse(&data["id"]) {
                Some(id) => events.push(RoomEvent::Joined {
                    room: FeedId::parse(&data["room"]),
                    id,
                    private_id: data.get("private_id").and_then(Value::as_u64),
                    publishers: parse_feeds(&data["publishers"]),
                }),
                None => tracing::warn!("joined message without feed id: {}", data),
            },
            Some("event") => {
                let publishers = parse_feeds(&data["publishers"]);
                if !publishers.is_empty() {
                    events.push(RoomEvent::Publishers(publishers));
                }
                for key in ["unpublished", "leaving"] {
                    if let Some(id) = data.get(key).and_then(parse_leaving) {
                        events.push(RoomEvent::FeedLeft(id));
                    }
                }
            }
            Some("participants") => {
                events.push(RoomEvent::Participants(parse_feeds(&data["participants"])));
            }
            Some("destroyed") => events.push(RoomEvent::Destroyed),
            _ => {}
        }

        events
    }
}

fn protocol_error(data: &Value) -> Option<Error> {
    let message = data.get("error").and_then(Value::as_str)?;
    let code = data.get("error_code").and_then(Value::as_i64);
    let kind = match code {
        Some(ROOM_NOT_FOUND_CODE) => ProtocolErrorKind::RoomNotFoundError,
        _ => ProtocolErrorKind::BackendError,
    };
    Some(Error::new_protocol(message.to_owned(), kind, code))
}

// The backend acknowledges our own unpublish/leave with "ok".
fn parse_leaving(value: &Value) -> Option<FeedId> {
    match value {
        Value::String(s) if s == "ok" => None,
        other => FeedId::parse(other),
    }
}

/// Booleans may arrive as `true` or as `"true"`.
fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn parse_feeds(value: &Value) -> Vec<Feed> {
    let Some(list) = value.as_array() else {
        return vec![];
    };
    list.iter()
        .filter_map(|publisher| {
            let feed = parse_feed(publisher);
            if feed.is_none() {
                tracing::warn!("publisher without identifier ignored: {}", publisher);
            }
            feed
        })
        .collect()
}

fn parse_feed(value: &Value) -> Option<Feed> {
    let id = FeedId::parse(value.get("id")?)?;
    let display = value
        .get("display")
        .and_then(Value::as_str)
        .map(|s| s.to_owned());

    let streams = value
        .get("streams")
        .and_then(Value::as_array)
        .map(|streams| {
            streams
                .iter()
                .filter(|s| !flag(&s["disabled"]).unwrap_or(false))
                .filter_map(|s| {
                    let kind = MediaKind::parse(s.get("type")?.as_str()?)?;
                    let mid = match s.get("mid")? {
                        Value::String(mid) => mid.clone(),
                        Value::Number(mid) => mid.to_string(),
                        _ => return None,
                    };
                    Some(StreamDescriptor::new(mid, kind))
                })
                .collect()
        })
        .unwrap_or_default();

    let mut feed = Feed::new(id, display, streams);
    feed.muted = flag(&value["muted"]).unwrap_or(false);
    feed.talking = flag(&value["talking"]).unwrap_or(false);
    Some(feed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_joined() {
        let data = json!({
            "videoroom": "joined",
            "room": 1234,
            "id": 5,
            "private_id": 99,
            "publishers": [
                {"id": 7, "display": "Alice", "streams": [
                    {"type": "audio", "mid": "0"},
                    {"type": "video", "mid": "1"},
                    {"type": "data", "mid": "2"}
                ]},
                {"display": "broken"}
            ]
        });
        let events = RoomEvent::parse(&data);
        assert_eq!(events.len(), 1);
        let RoomEvent::Joined {
            room,
            id,
            private_id,
            publishers,
        } = &events[0]
        else {
            panic!("expected joined event: {:?}", events);
        };
        assert_eq!(room, &Some(FeedId::Number(1234)));
        assert_eq!(id, &FeedId::Number(5));
        assert_eq!(private_id, &Some(99));
        assert_eq!(publishers.len(), 1);
        assert_eq!(
            publishers[0].streams,
            vec![
                StreamDescriptor::new("0", MediaKind::Audio),
                StreamDescriptor::new("1", MediaKind::Video)
            ]
        );
    }

    #[test]
    fn test_parse_event_with_publishers_and_leaving() {
        let data = json!({
            "videoroom": "event",
            "publishers": [{"id": "8", "muted": "true", "streams": [{"type": "audio", "mid": 3}]}],
            "leaving": 7
        });
        let events = RoomEvent::parse(&data);
        assert_eq!(events.len(), 2);
        let RoomEvent::Publishers(feeds) = &events[0] else {
            panic!("expected publishers: {:?}", events);
        };
        assert_eq!(feeds[0].id, FeedId::Number(8));
        assert!(feeds[0].muted);
        assert_eq!(feeds[0].streams[0].mid, "3");
        assert_eq!(events[1], RoomEvent::FeedLeft(FeedId::Number(7)));
    }

    #[test]
    fn test_own_unpublish_ack_is_not_a_feed() {
        let data = json!({"videoroom": "event", "unpublished": "ok"});
        assert!(RoomEvent::parse(&data).is_empty());
    }

    #[test]
    fn test_disabled_streams_are_skipped() {
        let data = json!({
            "videoroom": "event",
            "publishers": [{"id": 9, "streams": [
                {"type": "audio", "mid": "0", "disabled": true},
                {"type": "video", "mid": "1"}
            ]}]
        });
        let events = RoomEvent::parse(&data);
        let RoomEvent::Publishers(feeds) = &events[0] else {
            panic!("expected publishers: {:?}", events);
        };
        assert_eq!(feeds[0].streams, vec![StreamDescriptor::new("1", MediaKind::Video)]);
    }

    #[test]
    fn test_parse_destroyed_and_slowlink() {
        assert_eq!(
            RoomEvent::parse(&json!({"videoroom": "destroyed", "room": 1})),
            vec![RoomEvent::Destroyed]
        );
        assert_eq!(
            RoomEvent::parse(&json!({"janus": "slowlink", "uplink": true, "lost": 12})),
            vec![RoomEvent::SlowLink {
                uplink: true,
                lost: 12
            }]
        );
    }

    #[test]
    fn test_response_error_becomes_protocol_error() {
        let response = Response::new(
            json!({"videoroom": "event", "error_code": 485, "error": "No such room"}),
            None,
        );
        match response.into_result() {
            Err(Error::ProtocolError(e)) => {
                assert_eq!(e.kind, ProtocolErrorKind::RoomNotFoundError);
                assert_eq!(e.code, Some(485));
                assert_eq!(e.message, "No such room");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_request_bodies() {
        let (body, jsep) = Request::JoinSubscriber {
            room: FeedId::Number(1234),
            streams: vec![StreamRef::stream(FeedId::Number(7), "1".to_owned())],
            private_id: Some(99),
        }
        .to_message();
        assert_eq!(
            body,
            json!({"request": "join", "ptype": "subscriber", "room": 1234,
                   "streams": [{"feed": 7, "mid": "1"}], "private_id": 99})
        );
        assert!(jsep.is_none());

        let (body, _) = Request::Update {
            subscribe: vec![],
            unsubscribe: vec![StreamRef::feed(FeedId::Text("bob".to_owned()))],
        }
        .to_message();
        assert_eq!(
            body,
            json!({"request": "update", "unsubscribe": [{"feed": "bob"}]})
        );
    }
}
