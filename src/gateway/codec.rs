//! Frame encoding: JSON or ETF on the wire, negotiated by the connection
//! URL, plus the zlib deflate applied to READY for clients that asked for
//! `compress` at IDENTIFY.

use std::io::Write;
use std::str::FromStr;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use serde_json::Value;
use thiserror::Error;

use crate::serde_utils;

use super::etf::{self, EtfError};

/// Inbound frames above this many bytes close the socket with 4002.
pub const MAX_FRAME_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Etf,
}

impl FromStr for Encoding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "etf" => Ok(Self::Etf),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad json: {0}")]
    Json(#[from] serde_utils::Error),
    #[error("json encode: {0}")]
    JsonEncode(#[from] serde_json::Error),
    #[error("bad etf: {0}")]
    Etf(#[from] EtfError),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    TooLarge(usize),
    #[error("utf8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("compress: {0}")]
    Compress(#[from] std::io::Error),
}

impl Encoding {
    /// Whether encoded frames travel as websocket text or binary frames.
    pub const fn is_binary(self) -> bool {
        matches!(self, Self::Etf)
    }

    pub fn encode(self, payload: &Value) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(payload)?),
            Self::Etf => Ok(etf::to_bytes(payload)?),
        }
    }

    /// Decode an inbound frame to a json value, enforcing the size limit
    /// before touching the content.
    pub fn decode(self, bytes: &[u8]) -> Result<Value, CodecError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(CodecError::TooLarge(bytes.len()));
        }
        match self {
            Self::Json => {
                let text = std::str::from_utf8(bytes)?;
                Ok(serde_utils::nice_from_str(text)?)
            }
            Self::Etf => Ok(etf::from_bytes(bytes)?),
        }
    }
}

/// zlib-deflate an already encoded frame.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_round_trip() {
        let value = json!({"op": 0, "s": 3, "t": "MESSAGE_CREATE", "d": {"content": "hi"}});
        let bytes = Encoding::Json.encode(&value).unwrap();
        let back = Encoding::Json.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn etf_round_trip() {
        let value = json!({"op": 1, "d": 12});
        let bytes = Encoding::Etf.encode(&value).unwrap();
        let back = Encoding::Etf.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn oversize_frame_is_rejected_before_parsing() {
        let huge = vec![b'x'; MAX_FRAME_BYTES + 1];
        match Encoding::Json.decode(&huge) {
            Err(CodecError::TooLarge(n)) => assert_eq!(n, MAX_FRAME_BYTES + 1),
            other => panic!("expected TooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn exactly_at_the_limit_is_parsed() {
        // a json string padded to exactly the limit
        let mut text = String::from("{\"op\":1,\"d\":null,\"pad\":\"");
        while text.len() < MAX_FRAME_BYTES - 2 {
            text.push('a');
        }
        text.push_str("\"}");
        assert_eq!(text.len(), MAX_FRAME_BYTES);
        assert!(Encoding::Json.decode(text.as_bytes()).is_ok());
    }

    #[test]
    fn compressed_output_inflates_back() {
        use std::io::Read;

        let value = json!({"t": "READY", "d": {"session_id": "abc"}});
        let bytes = Encoding::Json.encode(&value).unwrap();
        let deflated = compress(&bytes).unwrap();

        let mut inflater = flate2::read::ZlibDecoder::new(&deflated[..]);
        let mut inflated = Vec::new();
        inflater.read_to_end(&mut inflated).unwrap();
        assert_eq!(inflated, bytes);
    }

    #[test]
    fn unknown_encoding_str() {
        assert!(Encoding::from_str("json").is_ok());
        assert!(Encoding::from_str("etf").is_ok());
        assert!(Encoding::from_str("msgpack").is_err());
    }
}
