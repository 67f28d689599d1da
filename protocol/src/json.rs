//! Newline-delimited JSON variant of the transport.
//!
//! One JSON object per line. Unparsable lines are dropped, not answered.
//! A `critical` message terminates the connection with a machine-readable
//! reason; the receiver closes immediately.

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::frame::WireError;

const MAX_LINE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonError {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonMsg {
    /// Termination notice; close now, no response expected.
    Critical { critical: String },
    ReplyErr {
        reply: String,
        error: JsonError,
    },
    ReplyOk {
        reply: String,
        result: serde_json::Value,
    },
    Request {
        command: String,
        #[serde(default)]
        arguments: Vec<serde_json::Value>,
        #[serde(default)]
        id: Option<String>,
    },
}

impl JsonMsg {
    pub fn request(command: &str, arguments: Vec<serde_json::Value>, id: Option<String>) -> Self {
        JsonMsg::Request {
            command: command.to_string(),
            arguments,
            id,
        }
    }

    pub fn critical(reason: &str) -> Self {
        JsonMsg::Critical {
            critical: reason.to_string(),
        }
    }
}

/// Line-buffered JSON codec. Decoding skips lines that do not parse.
pub struct JsonCodec {
    lines: LinesCodec,
    ready: VecDeque<JsonMsg>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LEN),
            ready: VecDeque::new(),
        }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn map_line_err(err: LinesCodecError) -> WireError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => WireError::ProtocolViolation("line too long"),
        LinesCodecError::Io(err) => WireError::Io(err),
    }
}

impl Decoder for JsonCodec {
    type Item = JsonMsg;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.lines.decode(src).map_err(map_line_err)? {
            match serde_json::from_str(&line) {
                Ok(msg) => self.ready.push_back(msg),
                Err(_) => continue,
            }
        }
        Ok(self.ready.pop_front())
    }
}

impl Encoder<JsonMsg> for JsonCodec {
    type Error = WireError;

    fn encode(&mut self, item: JsonMsg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item).map_err(|err| {
            WireError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })?;
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_shapes() {
        let req: JsonMsg =
            serde_json::from_str(r#"{"command":"hello","arguments":[{"type":"worker"}],"id":"1"}"#)
                .unwrap();
        assert!(matches!(req, JsonMsg::Request { ref command, .. } if command == "hello"));

        let ok: JsonMsg = serde_json::from_str(r#"{"reply":"1","result":["PONG",17]}"#).unwrap();
        assert_eq!(
            ok,
            JsonMsg::ReplyOk {
                reply: "1".into(),
                result: json!(["PONG", 17]),
            }
        );

        let err: JsonMsg = serde_json::from_str(
            r#"{"reply":"2","error":{"name":"Forbidden","message":"not yours"}}"#,
        )
        .unwrap();
        assert!(matches!(err, JsonMsg::ReplyErr { .. }));

        let crit: JsonMsg = serde_json::from_str(r#"{"critical":"AuthenticationFailure"}"#).unwrap();
        assert_eq!(crit, JsonMsg::critical("AuthenticationFailure"));
    }

    #[test]
    fn unparsable_lines_are_dropped() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::from(
            &b"not json at all\n{\"command\":\"get\",\"arguments\":[],\"id\":\"9\"}\n"[..],
        );
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, JsonMsg::Request { ref id, .. } if id.as_deref() == Some("9")));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn requests_without_id_parse() {
        let msg: JsonMsg = serde_json::from_str(r#"{"command":"job_available"}"#).unwrap();
        assert!(matches!(
            msg,
            JsonMsg::Request { id: None, ref arguments, .. } if arguments.is_empty()
        ));
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(JsonMsg::critical("AuthenticationFailure"), &mut buf)
            .unwrap();
        assert!(buf.ends_with(b"\n"));
        let round: JsonMsg = serde_json::from_slice(&buf[..buf.len() - 1]).unwrap();
        assert_eq!(round, JsonMsg::critical("AuthenticationFailure"));
    }
}
