use strum_macros::{Display, EnumIter};

/// Client-facing protocol a request arrived on.
#[derive(Debug, Display, EnumIter, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    #[strum(serialize = "SOCKS5")]
    Socks5,
    #[strum(serialize = "HTTP-CONNECT")]
    HttpConnect,
    /// plain HTTP request rewritten and sent as the first tunnel frame
    #[strum(serialize = "HTTP-FORWARD")]
    HttpForward,
}

/// Output of a protocol handler, consumed once by the tunnel session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    /// `host:port`, IPv6 hosts bracketed
    pub target: String,
    pub mode: ProxyMode,
    pub first_frame: Option<Vec<u8>>,
}

impl ParsedRequest {
    pub fn new(target: impl Into<String>, mode: ProxyMode) -> Self {
        Self {
            target: target.into(),
            mode,
            first_frame: None,
        }
    }

    pub fn with_first_frame(mut self, frame: Vec<u8>) -> Self {
        self.first_frame = Some(frame);
        self
    }
}
