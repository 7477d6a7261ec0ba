//! # Relay Wire Types
//!
//! JSON documents exchanged over UDP between transport clients and the
//! relay broker.
//!
//! ```text
//! RelayEnvelope  { "protocol": "UDP"|"TCP", "ip": "10.0.0.5", "port": 1001, "content": [[1,3,0,0,0,10,197,205]] }
//! RelayResponse  { "status": 1, "content": [[1,3,20,...]] }
//! RelayResponse  { "status": 0, "content": "timed out" }
//! ```
//!
//! Both sides share one maximum datagram size; a document that does not fit
//! is a transport failure.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// Protocol the broker uses to reach a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }

    /// Resolve an envelope's `protocol` field.
    pub fn from_name(name: &str) -> ModbusResult<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportProtocol::Udp),
            "TCP" => Ok(TransportProtocol::Tcp),
            _ => Err(ModbusError::Relay {
                protocol: name.to_string(),
            }),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request from a client: wire messages to exchange with one device, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Kept as received so unknown protocols can be reported back.
    pub protocol: String,
    pub ip: String,
    pub port: u16,
    pub content: Vec<Bytes>,
}

impl RelayEnvelope {
    pub fn new(
        protocol: TransportProtocol,
        ip: impl Into<String>,
        port: u16,
        content: Vec<Bytes>,
    ) -> Self {
        Self {
            protocol: protocol.as_str().to_string(),
            ip: ip.into(),
            port,
            content,
        }
    }

    pub fn transport(&self) -> ModbusResult<TransportProtocol> {
        TransportProtocol::from_name(&self.protocol)
    }

    /// Messages to one destination ip are relayed one envelope at a time.
    #[inline]
    pub fn routing_key(&self) -> &str {
        &self.ip
    }

    pub fn encode(&self, max_msg_size: usize) -> ModbusResult<Vec<u8>> {
        encode_bounded(self, max_msg_size)
    }

    pub fn decode(datagram: &[u8]) -> ModbusResult<Self> {
        Ok(serde_json::from_slice(datagram)?)
    }
}

/// Reply content: raw device replies, or a failure description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseContent {
    Frames(Vec<Bytes>),
    Message(String),
}

/// Broker reply to one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayResponse {
    /// 1 on success, 0 on failure.
    pub status: u8,
    pub content: ResponseContent,
}

impl RelayResponse {
    pub const SUCCESS: u8 = 1;
    pub const FAILURE: u8 = 0;

    pub fn success(frames: Vec<Bytes>) -> Self {
        Self {
            status: Self::SUCCESS,
            content: ResponseContent::Frames(frames),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: Self::FAILURE,
            content: ResponseContent::Message(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }

    /// Device replies on success; the broker's description as an error otherwise.
    pub fn into_frames(self) -> ModbusResult<Vec<Bytes>> {
        match (self.status, self.content) {
            (Self::SUCCESS, ResponseContent::Frames(frames)) => Ok(frames),
            (Self::FAILURE, ResponseContent::Message(message)) => Err(ModbusError::broker(message)),
            (Self::FAILURE, ResponseContent::Frames(_)) => {
                Err(ModbusError::broker("failure without description"))
            }
            (status, _) => Err(ModbusError::protocol(format!(
                "malformed broker response with status {}",
                status
            ))),
        }
    }

    pub fn encode(&self, max_msg_size: usize) -> ModbusResult<Vec<u8>> {
        encode_bounded(self, max_msg_size)
    }

    pub fn decode(datagram: &[u8]) -> ModbusResult<Self> {
        Ok(serde_json::from_slice(datagram)?)
    }
}

fn encode_bounded<T: Serialize>(value: &T, max_msg_size: usize) -> ModbusResult<Vec<u8>> {
    let encoded = serde_json::to_vec(value)?;
    if encoded.len() > max_msg_size {
        return Err(ModbusError::transport(format!(
            "message of {} bytes exceeds MAX_MSG_SIZE {}",
            encoded.len(),
            max_msg_size
        )));
    }
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = RelayEnvelope::new(
            TransportProtocol::Udp,
            "10.0.0.5",
            1001,
            vec![Bytes::from_static(&[1, 3, 0, 0, 0, 10, 197, 205])],
        );
        let encoded = envelope.encode(1024).unwrap();
        assert_eq!(
            std::str::from_utf8(&encoded).unwrap(),
            r#"{"protocol":"UDP","ip":"10.0.0.5","port":1001,"content":[[1,3,0,0,0,10,197,205]]}"#
        );
        assert_eq!(RelayEnvelope::decode(&encoded).unwrap(), envelope);
    }

    #[test]
    fn test_unknown_protocol_is_relay_error() {
        let envelope: RelayEnvelope =
            serde_json::from_str(r#"{"protocol":"SERIAL","ip":"1.2.3.4","port":1,"content":[]}"#)
                .unwrap();
        let err = envelope.transport().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Relay);
        assert_eq!(err.to_string(), "Unknown protocol: SERIAL");
        assert_eq!(
            TransportProtocol::from_name("tcp").unwrap(),
            TransportProtocol::Tcp
        );
    }

    #[test]
    fn test_response_content_shapes() {
        let ok = RelayResponse::decode(br#"{"status":1,"content":[[1,2],[3]]}"#).unwrap();
        assert!(ok.is_success());
        assert_eq!(
            ok.into_frames().unwrap(),
            vec![Bytes::from_static(&[1, 2]), Bytes::from_static(&[3])]
        );

        let failed = RelayResponse::decode(br#"{"status":0,"content":"timed out"}"#).unwrap();
        assert_eq!(failed.content, ResponseContent::Message("timed out".into()));
        let err = failed.into_frames().unwrap_err();
        assert!(matches!(err, ModbusError::Broker { ref message } if message == "timed out"));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_malformed_status() {
        let response = RelayResponse {
            status: 7,
            content: ResponseContent::Frames(vec![]),
        };
        assert_eq!(response.into_frames().unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_oversized_message_is_transport_error() {
        let envelope = RelayEnvelope::new(
            TransportProtocol::Tcp,
            "10.0.0.5",
            502,
            vec![Bytes::from(vec![0u8; 64])],
        );
        let err = envelope.encode(32).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
