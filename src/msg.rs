use bytebuffer::ByteBuffer;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::Message;

pub const CONNECT_PREFIX: &[u8] = b"CONNECT:";
pub const CONNECTED: &str = "CONNECTED";
pub const ERROR_PREFIX: &str = "ERROR:";
pub const CLOSE: &str = "CLOSE";

/// `CONNECT:<target>|<payload>[|<fallback_ip>]`
pub fn connect_payload(target: &str, first_frame: &[u8], fallback_ip: Option<&str>) -> Vec<u8> {
    let mut buf = ByteBuffer::new();
    buf.write_bytes(CONNECT_PREFIX);
    buf.write_bytes(target.as_bytes());
    buf.write_u8(b'|');
    buf.write_bytes(first_frame);
    if let Some(ip) = fallback_ip {
        buf.write_u8(b'|');
        buf.write_bytes(ip.as_bytes());
    }
    buf.into_vec()
}

/// The connect request as a text frame. Early data is raw client bytes and
/// may not be valid UTF-8, so the frame is assembled directly instead of
/// going through `Message::Text`.
pub fn connect_message(target: &str, first_frame: &[u8], fallback_ip: Option<&str>) -> Message {
    let payload = connect_payload(target, first_frame, fallback_ip);
    Message::Frame(Frame::message(payload, OpCode::Data(Data::Text), true))
}

pub fn close_message() -> Message {
    Message::text(CLOSE)
}

/// Remote answer to the connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Connected,
    /// full `ERROR:...` text
    Error(String),
    Unexpected(String),
}

impl Reply {
    pub fn parse(payload: &[u8]) -> Reply {
        let text = String::from_utf8_lossy(payload);
        if text.starts_with(ERROR_PREFIX) {
            Reply::Error(text.into_owned())
        } else if text == CONNECTED {
            Reply::Connected
        } else {
            Reply::Unexpected(text.into_owned())
        }
    }
}
