// wire-protocol: the JSON-over-WebSocket envelope shared by the local
// dashboard connections and the remote tunnel client.
//
// A frame is a JSON object whose keys are message types, e.g.
// `{"auth": {"password": "hunter2x"}}`. An optional sibling `id` field
// identifies the remote-tunnel sender a reply should be routed back to.
// Unlike a conventional internally-tagged enum, an unrecognized top-level
// key is not a parse error: `parse_client_frame` returns `Ok(None)` so the
// caller can log and drop the frame, matching the single-field dynamic
// envelope this protocol was designed around.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Client -> server messages
// ---------------------------------------------------------------------------

/// `{"auth": ...}` — either a password attempt or a bare token.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AuthRequest {
    Password {
        password: String,
        #[serde(default)]
        persistent_token: bool,
    },
    Token {
        token: String,
    },
}

/// `{"config": ...}` — the only two fields an operator may set directly.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ConfigRequest {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub remote_key: Option<String>,
}

/// `{"start": ...}` — streaming parameters, validated by the streaming
/// supervisor before anything is persisted or spawned.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StartParams {
    pub delay: i32,
    pub pipeline: String,
    pub max_br: i64,
    pub srt_latency: i64,
    pub srt_streamid: String,
    pub srtla_addr: String,
    pub srtla_port: u32,
}

/// `{"bitrate": ...}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BitrateRequest {
    pub max_br: i64,
}

/// `{"command": "..."}` — the value is a bare string, not an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Poweroff,
    Reboot,
    Update,
    StartSsh,
    StopSsh,
    ResetSshPass,
}

/// `{"netif": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetifRequest {
    pub name: String,
    pub ip: String,
    pub enabled: bool,
}

/// `{"wifi": {<action>: ...}}` — itself a one-key dispatch, same shape as
/// the outer envelope, so it reuses [`single_key`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum WifiRequest {
    Scan,
    Connect { uuid: String },
    Disconnect { uuid: String },
    Forget { uuid: String },
    New {
        device_id: u64,
        ssid: String,
        #[serde(default)]
        password: Option<String>,
    },
}

/// A parsed, dispatch-ready inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Auth(AuthRequest),
    Config(ConfigRequest),
    Keepalive,
    Start(StartParams),
    Stop,
    Bitrate(BitrateRequest),
    Command(CommandKind),
    Netif(NetifRequest),
    Wifi(WifiRequest),
    Logout,
}

/// A decoded client frame paired with its optional tunnel sender id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub id: Option<String>,
    pub message: ClientMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("malformed {key} payload: {source}")]
    Payload {
        key: &'static str,
        source: serde_json::Error,
    },
}

/// Returns the sole key/value pair of a one-entry JSON object, or `None`
/// if `value` is not an object or has a number of entries other than one.
fn single_key(value: &Value) -> Option<(&str, &Value)> {
    let obj = value.as_object()?;
    let mut iter = obj.iter();
    let first = iter.next()?;
    if iter.next().is_some() {
        return None;
    }
    Some((first.0.as_str(), first.1))
}

fn decode<T: for<'de> Deserialize<'de>>(
    key: &'static str,
    value: &Value,
) -> Result<T, FrameParseError> {
    serde_json::from_value(value.clone()).map_err(|source| FrameParseError::Payload { key, source })
}

/// Parse one inbound WS text frame.
///
/// `Ok(None)` means the frame parsed as JSON but named no recognized
/// message type — the caller drops it silently, per protocol design.
/// `Err` means the text itself was not valid JSON, or a recognized key
/// carried a payload that didn't match its expected shape.
pub fn parse_client_frame(text: &str) -> Result<Option<ClientFrame>, FrameParseError> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value.as_object().ok_or(FrameParseError::NotAnObject)?;
    let id = obj.get("id").and_then(Value::as_str).map(str::to_owned);

    let message = if let Some(v) = obj.get("auth") {
        ClientMessage::Auth(decode("auth", v)?)
    } else if let Some(v) = obj.get("config") {
        ClientMessage::Config(decode("config", v)?)
    } else if obj.contains_key("keepalive") {
        ClientMessage::Keepalive
    } else if let Some(v) = obj.get("start") {
        ClientMessage::Start(decode("start", v)?)
    } else if obj.contains_key("stop") {
        ClientMessage::Stop
    } else if let Some(v) = obj.get("bitrate") {
        ClientMessage::Bitrate(decode("bitrate", v)?)
    } else if let Some(v) = obj.get("command") {
        ClientMessage::Command(decode("command", v)?)
    } else if let Some(v) = obj.get("netif") {
        ClientMessage::Netif(decode("netif", v)?)
    } else if let Some(v) = obj.get("wifi") {
        ClientMessage::Wifi(decode_wifi(v)?)
    } else if obj.contains_key("logout") {
        ClientMessage::Logout
    } else {
        return Ok(None);
    };

    Ok(Some(ClientFrame { id, message }))
}

fn decode_wifi(value: &Value) -> Result<WifiRequest, FrameParseError> {
    let (key, inner) = single_key(value).ok_or(FrameParseError::Payload {
        key: "wifi",
        source: serde::de::Error::custom("expected a single-key wifi action object"),
    })?;
    match key {
        "scan" => Ok(WifiRequest::Scan),
        "connect" => Ok(WifiRequest::Connect {
            uuid: decode("wifi.connect", inner)?,
        }),
        "disconnect" => Ok(WifiRequest::Disconnect {
            uuid: decode("wifi.disconnect", inner)?,
        }),
        "forget" => Ok(WifiRequest::Forget {
            uuid: decode("wifi.forget", inner)?,
        }),
        "new" => {
            #[derive(Deserialize)]
            struct NewFields {
                device_id: u64,
                ssid: String,
                #[serde(default)]
                password: Option<String>,
            }
            let fields: NewFields = decode("wifi.new", inner)?;
            Ok(WifiRequest::New {
                device_id: fields.device_id,
                ssid: fields.ssid,
                password: fields.password,
            })
        }
        _ => Err(FrameParseError::Payload {
            key: "wifi",
            source: serde::de::Error::custom(format!("unknown wifi action {key}")),
        }),
    }
}

// ---------------------------------------------------------------------------
// Server -> client messages
// ---------------------------------------------------------------------------

/// `{"auth": {...}}` reply to a successful or failed auth attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteAuthError {
    Key,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RemoteStatus {
    Connected(bool),
    Error { error: RemoteAuthError },
}

/// `{"status": {...}}` — the operator-facing summary broadcast after any
/// state change that affects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_updates: Option<AvailableUpdates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updating: Option<UpdateProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_password: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct AvailableUpdates {
    pub package_count: u32,
    pub download_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct UpdateProgress {
    pub downloading: u32,
    pub unpacking: u32,
    pub setting_up: u32,
    pub total: u32,
    /// `0` on success, the captured stderr text on failure; set once, on
    /// the terminal broadcast for an upgrade, and absent otherwise (§4.9).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct SshStatus {
    pub username: Option<String>,
    pub active: bool,
    pub user_pass: bool,
}

/// `{"config": {...}}` — always the secret-stripped projection; see
/// `ssh_pass_hash`/`password_hash` stripping in the config store.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct PublicConfig {
    pub remote_key: Option<String>,
    pub delay: Option<i32>,
    pub pipeline: Option<String>,
    pub max_br: Option<i64>,
    pub srt_latency: Option<i64>,
    pub srt_streamid: Option<String>,
    pub srtla_addr: Option<String>,
    pub srtla_port: Option<u32>,
}

/// `{"netif": {name: {...}}}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NetifEntry {
    pub ip: std::net::Ipv4Addr,
    pub txb: u64,
    pub tp: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationView {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub msg: String,
    pub duration: u64,
    pub dismissable: bool,
}

/// `{"notification": {"show": [...] } | {"remove": [...] }}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationUpdate {
    Show(Vec<NotificationView>),
    Remove(Vec<String>),
}

/// Top-level server->client variants. Uses serde's default external
/// representation (`rename_all = "snake_case"`), which serializes a
/// unit variant as a bare string key and a data variant as
/// `{"variant_name": data}` — exactly the envelope this protocol wants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Auth(AuthReply),
    Status(StatusUpdate),
    Config(PublicConfig),
    Pipelines(std::collections::BTreeMap<String, String>),
    Netif(std::collections::BTreeMap<String, NetifEntry>),
    Sensors(std::collections::BTreeMap<String, String>),
    Revisions(std::collections::BTreeMap<String, String>),
    Notification(NotificationUpdate),
    Bitrate(BitrateRequest),
    Wifi(Value),
}

/// An outbound frame, with the same optional `id` sibling field used for
/// routing replies back through the remote tunnel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerFrame {
    pub fn new(message: ServerMessage) -> Self {
        Self { id: None, message }
    }

    pub fn tagged(id: String, message: ServerMessage) -> Self {
        Self {
            id: Some(id),
            message,
        }
    }

    /// # Panics
    /// Never, in practice — every `ServerMessage` variant here is built
    /// from plain, already-validated data with no non-finite floats or
    /// non-string map keys, so `serde_json` serialization cannot fail.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerFrame always serializes")
    }
}

// ---------------------------------------------------------------------------
// Remote tunnel handshake (§4.8)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelAuth {
    pub key: String,
    pub version: u32,
}

pub const TUNNEL_PROTOCOL_VERSION: u32 = 6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_password_auth_with_default_persistent_token() {
        let frame = parse_client_frame(r#"{"auth":{"password":"hunter2x"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(frame.id, None);
        match frame.message {
            ClientMessage::Auth(AuthRequest::Password {
                password,
                persistent_token,
            }) => {
                assert_eq!(password, "hunter2x");
                assert!(!persistent_token);
            }
            other => panic!("expected password auth, got {other:?}"),
        }
    }

    #[test]
    fn parses_token_auth() {
        let frame = parse_client_frame(r#"{"auth":{"token":"abc123"}}"#)
            .unwrap()
            .unwrap();
        match frame.message {
            ClientMessage::Auth(AuthRequest::Token { token }) => assert_eq!(token, "abc123"),
            other => panic!("expected token auth, got {other:?}"),
        }
    }

    #[test]
    fn carries_sender_id_alongside_message() {
        let frame = parse_client_frame(r#"{"id":"relay-7","bitrate":{"max_br":6000}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(frame.id.as_deref(), Some("relay-7"));
        assert_eq!(
            frame.message,
            ClientMessage::Bitrate(BitrateRequest { max_br: 6000 })
        );
    }

    #[test]
    fn unrecognized_top_level_key_is_ignored_not_an_error() {
        let result = parse_client_frame(r#"{"frobnicate":{}}"#).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = parse_client_frame("{not-json").unwrap_err();
        assert!(matches!(err, FrameParseError::Json(_)));
    }

    #[test]
    fn top_level_array_is_not_an_object() {
        let err = parse_client_frame("[1,2,3]").unwrap_err();
        assert!(matches!(err, FrameParseError::NotAnObject));
    }

    #[test]
    fn parses_wifi_connect_action() {
        let frame = parse_client_frame(r#"{"wifi":{"connect":{"uuid":"u-1"}}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            frame.message,
            ClientMessage::Wifi(WifiRequest::Connect {
                uuid: "u-1".to_owned()
            })
        );
    }

    #[test]
    fn parses_wifi_new_action_with_optional_password() {
        let frame =
            parse_client_frame(r#"{"wifi":{"new":{"device_id":3,"ssid":"home","password":"x"}}}"#)
                .unwrap()
                .unwrap();
        assert_eq!(
            frame.message,
            ClientMessage::Wifi(WifiRequest::New {
                device_id: 3,
                ssid: "home".to_owned(),
                password: Some("x".to_owned()),
            })
        );
    }

    #[test]
    fn wifi_action_with_two_keys_is_rejected() {
        let err = parse_client_frame(r#"{"wifi":{"connect":{"uuid":"u-1"},"scan":{}}}"#)
            .unwrap_err();
        assert!(matches!(err, FrameParseError::Payload { key: "wifi", .. }));
    }

    #[test]
    fn keepalive_and_stop_and_logout_carry_no_payload() {
        assert_eq!(
            parse_client_frame(r#"{"keepalive":{}}"#)
                .unwrap()
                .unwrap()
                .message,
            ClientMessage::Keepalive
        );
        assert_eq!(
            parse_client_frame(r#"{"stop":{}}"#).unwrap().unwrap().message,
            ClientMessage::Stop
        );
        assert_eq!(
            parse_client_frame(r#"{"logout":{}}"#)
                .unwrap()
                .unwrap()
                .message,
            ClientMessage::Logout
        );
    }

    #[test]
    fn server_message_serializes_with_type_as_the_object_key() {
        let frame = ServerFrame::new(ServerMessage::Status(StatusUpdate {
            is_streaming: Some(true),
            ..Default::default()
        }));
        let json: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["status"]["is_streaming"], Value::Bool(true));
        assert!(json.get("id").is_none());
    }

    #[test]
    fn server_frame_includes_id_when_tagged_for_a_remote_sender() {
        let frame = ServerFrame::tagged(
            "relay-9".to_owned(),
            ServerMessage::Bitrate(BitrateRequest { max_br: 6000 }),
        );
        let json: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["id"], Value::String("relay-9".to_owned()));
        assert_eq!(json["bitrate"]["max_br"], Value::Number(6000.into()));
    }

    #[test]
    fn command_kind_round_trips_as_a_bare_string() {
        let frame = parse_client_frame(r#"{"command":"start_ssh"}"#).unwrap().unwrap();
        assert_eq!(
            frame.message,
            ClientMessage::Command(CommandKind::StartSsh)
        );
    }
}
