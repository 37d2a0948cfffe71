//! Control channel protocol
//!
//! Frames are newline-terminated textual URL renderings with two populated
//! fields: the fragment carries a mode tag and the host carries a data
//! channel id. A bare newline is a keepalive.
//!
//! ```text
//! handshake   #<code>\n     (first frame only)
//! keepalive   \n
//! flush       #0\n
//! TCP launch  //<id>#1\n
//! UDP launch  //<id>#2\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fragment tag ordering a pool flush
pub const FLUSH_TAG: &str = "0";

/// Fragment tag launching a TCP relay
pub const TCP_TAG: &str = "1";

/// Fragment tag launching a UDP relay
pub const UDP_TAG: &str = "2";

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unknown launch mode: {0}")]
    UnknownMode(String),
}

/// Relay mode carried by a launch frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Tcp,
    Udp,
}

impl LaunchMode {
    fn tag(self) -> &'static str {
        match self {
            LaunchMode::Tcp => TCP_TAG,
            LaunchMode::Udp => UDP_TAG,
        }
    }
}

/// A control channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// First frame on the control channel; carries the TLS mode code the
    /// client applies to the data channels it opens.
    Handshake { tls_code: String },
    /// Liveness probe emitted every report interval
    Keepalive,
    /// Orders the client to discard its idle data channels
    Flush,
    /// Binds the data channel `id` to a relay mode on the client side
    Launch { id: String, mode: LaunchMode },
}

impl ControlFrame {
    /// Create a TCP launch frame
    pub fn launch_tcp(id: impl Into<String>) -> Self {
        Self::Launch {
            id: id.into(),
            mode: LaunchMode::Tcp,
        }
    }

    /// Create a UDP launch frame
    pub fn launch_udp(id: impl Into<String>) -> Self {
        Self::Launch {
            id: id.into(),
            mode: LaunchMode::Udp,
        }
    }

    /// Encode the frame, including the terminating newline.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ControlFrame::Handshake { tls_code } => {
                buf.put_u8(b'#');
                buf.put_slice(tls_code.as_bytes());
            }
            ControlFrame::Keepalive => {}
            ControlFrame::Flush => {
                buf.put_u8(b'#');
                buf.put_slice(FLUSH_TAG.as_bytes());
            }
            ControlFrame::Launch { id, mode } => {
                buf.put_slice(b"//");
                buf.put_slice(id.as_bytes());
                buf.put_u8(b'#');
                buf.put_slice(mode.tag().as_bytes());
            }
        }
        buf.put_u8(b'\n');
        buf.freeze()
    }

    /// Decode one frame from a line, with or without its trailing newline.
    ///
    /// `#0` always decodes as a flush; a handshake frame is recognised by
    /// its position (first line of the stream), so a `tls_code` of `"0"`
    /// is indistinguishable from a flush on the wire.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.strip_suffix('\n').unwrap_or(line);

        if line.is_empty() {
            return Ok(ControlFrame::Keepalive);
        }

        if let Some(rest) = line.strip_prefix("//") {
            let (id, tag) = rest
                .split_once('#')
                .ok_or_else(|| ProtocolError::InvalidFrame(line.to_string()))?;
            if id.is_empty() {
                return Err(ProtocolError::InvalidFrame(line.to_string()));
            }
            let mode = match tag {
                TCP_TAG => LaunchMode::Tcp,
                UDP_TAG => LaunchMode::Udp,
                other => return Err(ProtocolError::UnknownMode(other.to_string())),
            };
            return Ok(ControlFrame::Launch {
                id: id.to_string(),
                mode,
            });
        }

        if let Some(code) = line.strip_prefix('#') {
            if code == FLUSH_TAG {
                return Ok(ControlFrame::Flush);
            }
            return Ok(ControlFrame::Handshake {
                tls_code: code.to_string(),
            });
        }

        Err(ProtocolError::InvalidFrame(line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        let handshake = ControlFrame::Handshake {
            tls_code: "AES".to_string(),
        };
        assert_eq!(&handshake.encode()[..], b"#AES\n");
        assert_eq!(&ControlFrame::Keepalive.encode()[..], b"\n");
        assert_eq!(&ControlFrame::Flush.encode()[..], b"#0\n");
        assert_eq!(&ControlFrame::launch_tcp("a1b2c3d4").encode()[..], b"//a1b2c3d4#1\n");
        assert_eq!(&ControlFrame::launch_udp("a1b2c3d4").encode()[..], b"//a1b2c3d4#2\n");
    }

    #[test]
    fn test_roundtrip() {
        for frame in [
            ControlFrame::Handshake {
                tls_code: "2".to_string(),
            },
            ControlFrame::Keepalive,
            ControlFrame::Flush,
            ControlFrame::launch_tcp("deadbeef"),
            ControlFrame::launch_udp("cafebabe"),
        ] {
            let encoded = frame.encode();
            let line = std::str::from_utf8(&encoded).unwrap();
            assert_eq!(ControlFrame::decode(line).unwrap(), frame);
        }
    }

    #[test]
    fn test_decode_without_newline() {
        assert_eq!(
            ControlFrame::decode("//abcd#1").unwrap(),
            ControlFrame::launch_tcp("abcd")
        );
        assert_eq!(ControlFrame::decode("").unwrap(), ControlFrame::Keepalive);
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let err = ControlFrame::decode("//abcd#9\n").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMode(_)));
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(ControlFrame::decode("//missing-tag\n").is_err());
        assert!(ControlFrame::decode("//#1\n").is_err());
        assert!(ControlFrame::decode("garbage\n").is_err());
    }
}
