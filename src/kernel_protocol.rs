//! Jupyter messaging protocol (v5.3) framing, signing and typed IOPub content.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use sha2::Sha256;

use crate::error::ProtocolError;

pub const DELIMITER: &[u8] = b"<IDS|MSG>";
pub const PROTOCOL_VERSION: &str = "5.3";
const USERNAME: &str = "mcp-interpreter";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

/// Signs outbound messages and verifies inbound ones. An empty key disables signing.
#[derive(Clone)]
pub struct Signer {
    key: Option<Vec<u8>>,
}

impl Signer {
    pub fn new(key: &str, scheme: &str) -> Result<Self, ProtocolError> {
        if key.is_empty() {
            return Ok(Self { key: None });
        }
        if scheme != "hmac-sha256" {
            return Err(ProtocolError::UnsupportedScheme(scheme.to_string()));
        }
        Ok(Self {
            key: Some(key.as_bytes().to_vec()),
        })
    }

    fn mac(&self, parts: &[&[u8]]) -> Option<HmacSha256> {
        let key = self.key.as_ref()?;
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        for part in parts {
            mac.update(part);
        }
        Some(mac)
    }

    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match self.mac(parts) {
            Some(mac) => hex::encode(mac.finalize().into_bytes()),
            None => String::new(),
        }
    }

    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<(), ProtocolError> {
        let Some(mac) = self.mac(parts) else {
            return Ok(());
        };
        let expected = hex::decode(signature).map_err(|_| ProtocolError::BadSignature)?;
        mac.verify_slice(&expected)
            .map_err(|_| ProtocolError::BadSignature)
    }
}

/// Client side of one kernel conversation: owns the session id stamped on every request.
#[derive(Clone)]
pub struct MessageBuilder {
    session: String,
    signer: Signer,
}

/// A request ready for the wire plus the id replies will be parented to.
pub struct OutboundMessage {
    pub msg_id: String,
    pub frames: Vec<Bytes>,
}

impl MessageBuilder {
    pub fn new(signer: Signer) -> Self {
        Self {
            session: uuid::Uuid::new_v4().to_string(),
            signer,
        }
    }

    #[cfg(test)]
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn build(&self, msg_type: &str, content: JsonValue) -> OutboundMessage {
        let header = Header {
            msg_id: uuid::Uuid::new_v4().to_string(),
            session: self.session.clone(),
            username: USERNAME.to_string(),
            date: chrono::Utc::now().to_rfc3339(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        };
        let msg_id = header.msg_id.clone();
        let header = serde_json::to_vec(&header).unwrap_or_default();
        let parent = b"{}".to_vec();
        let metadata = b"{}".to_vec();
        let content = serde_json::to_vec(&content).unwrap_or_default();
        let signature = self.signer.sign(&[&header, &parent, &metadata, &content]);
        OutboundMessage {
            msg_id,
            frames: vec![
                Bytes::from_static(DELIMITER),
                Bytes::from(signature),
                Bytes::from(header),
                Bytes::from(parent),
                Bytes::from(metadata),
                Bytes::from(content),
            ],
        }
    }

    pub fn execute_request(&self, code: &str, silent: bool, stop_on_error: bool) -> OutboundMessage {
        self.build(
            "execute_request",
            json!({
                "code": code,
                "silent": silent,
                "store_history": !silent,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": stop_on_error,
            }),
        )
    }

    pub fn kernel_info_request(&self) -> OutboundMessage {
        self.build("kernel_info_request", json!({}))
    }

    pub fn shutdown_request(&self) -> OutboundMessage {
        self.build("shutdown_request", json!({ "restart": false }))
    }
}

#[derive(Debug, Clone)]
pub struct KernelMessage {
    pub header: Header,
    pub parent_msg_id: Option<String>,
    pub content: JsonValue,
}

impl KernelMessage {
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn is_reply_to(&self, msg_id: &str) -> bool {
        self.parent_msg_id.as_deref() == Some(msg_id)
    }

    /// Parses `[identities..., <IDS|MSG>, signature, header, parent, metadata, content, ...]`.
    pub fn decode(frames: &[Bytes], signer: &Signer) -> Result<Self, ProtocolError> {
        let start = frames
            .iter()
            .position(|frame| frame.as_ref() == DELIMITER)
            .ok_or(ProtocolError::MissingDelimiter)?;
        let rest = &frames[start + 1..];
        if rest.len() < 5 {
            return Err(ProtocolError::TooFewFrames {
                expected: 5,
                actual: rest.len(),
            });
        }
        let (signature, header, parent, metadata, content) =
            (&rest[0], &rest[1], &rest[2], &rest[3], &rest[4]);
        signer.verify(signature, &[header, parent, metadata, content])?;

        let header: Header = serde_json::from_slice(header).map_err(|source| ProtocolError::Json {
            part: "header",
            source,
        })?;
        let parent: JsonValue =
            serde_json::from_slice(parent).map_err(|source| ProtocolError::Json {
                part: "parent_header",
                source,
            })?;
        let content: JsonValue =
            serde_json::from_slice(content).map_err(|source| ProtocolError::Json {
                part: "content",
                source,
            })?;
        let parent_msg_id = parent
            .get("msg_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        Ok(Self {
            header,
            parent_msg_id,
            content,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// The subset of a MIME bundle the result formatter cares about.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct MimeBundle {
    #[serde(rename = "text/plain", default)]
    pub text_plain: Option<String>,
    #[serde(rename = "image/png", default)]
    pub image_png: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IopubEvent {
    Status(ExecutionState),
    Stream { name: StreamName, text: String },
    ExecuteResult(MimeBundle),
    DisplayData(MimeBundle),
    Error { traceback: Vec<String> },
    Other(String),
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: String,
}

#[derive(Deserialize)]
struct StreamContent {
    name: String,
    text: String,
}

#[derive(Deserialize)]
struct DataContent {
    #[serde(default)]
    data: MimeBundle,
}

#[derive(Deserialize)]
struct ErrorContent {
    #[serde(default)]
    traceback: Vec<String>,
}

impl IopubEvent {
    pub fn from_message(message: &KernelMessage) -> Result<Self, ProtocolError> {
        let content = message.content.clone();
        let json_err = |source| ProtocolError::Json {
            part: "content",
            source,
        };
        let event = match message.msg_type() {
            "status" => {
                let status: StatusContent = serde_json::from_value(content).map_err(json_err)?;
                IopubEvent::Status(match status.execution_state.as_str() {
                    "busy" => ExecutionState::Busy,
                    "idle" => ExecutionState::Idle,
                    "starting" => ExecutionState::Starting,
                    _ => ExecutionState::Other,
                })
            }
            "stream" => {
                let stream: StreamContent = serde_json::from_value(content).map_err(json_err)?;
                IopubEvent::Stream {
                    name: if stream.name == "stderr" {
                        StreamName::Stderr
                    } else {
                        StreamName::Stdout
                    },
                    text: stream.text,
                }
            }
            "execute_result" => {
                let data: DataContent = serde_json::from_value(content).map_err(json_err)?;
                IopubEvent::ExecuteResult(data.data)
            }
            "display_data" => {
                let data: DataContent = serde_json::from_value(content).map_err(json_err)?;
                IopubEvent::DisplayData(data.data)
            }
            "error" => {
                let error: ErrorContent = serde_json::from_value(content).map_err(json_err)?;
                IopubEvent::Error {
                    traceback: error.traceback,
                }
            }
            other => IopubEvent::Other(other.to_string()),
        };
        Ok(event)
    }
}
