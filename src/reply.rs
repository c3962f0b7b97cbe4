use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::request::ProxyMode;
use crate::socks5::{self, REP_GENERAL_FAILURE, REP_SUCCESS};
use crate::Result;

pub const HTTP_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const HTTP_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const HTTP_METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
pub const HTTP_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Bytes telling the client its tunnel could not be opened.
pub fn failure(mode: ProxyMode) -> Vec<u8> {
    match mode {
        ProxyMode::Socks5 => socks5::reply(REP_GENERAL_FAILURE),
        ProxyMode::HttpConnect | ProxyMode::HttpForward => HTTP_BAD_GATEWAY.to_vec(),
    }
}

/// Bytes telling the client its tunnel is up. Forwarded HTTP requests get
/// nothing: the upstream response is the reply.
pub fn success(mode: ProxyMode) -> Option<Vec<u8>> {
    match mode {
        ProxyMode::Socks5 => Some(socks5::reply(REP_SUCCESS)),
        ProxyMode::HttpConnect => Some(HTTP_ESTABLISHED.to_vec()),
        ProxyMode::HttpForward => None,
    }
}

/// Best effort: the client may already be gone.
pub async fn send_failure<W>(client: &mut W, mode: ProxyMode)
where
    W: AsyncWrite + Unpin,
{
    let _ = client.write_all(&failure(mode)).await;
}

pub async fn send_success<W>(client: &mut W, mode: ProxyMode) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(bytes) = success(mode) {
        client.write_all(&bytes).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn socks5_replies() {
        assert_eq!(failure(ProxyMode::Socks5), [5, 4, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            success(ProxyMode::Socks5).unwrap(),
            [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn http_replies() {
        assert_eq!(failure(ProxyMode::HttpConnect), HTTP_BAD_GATEWAY);
        assert_eq!(failure(ProxyMode::HttpForward), HTTP_BAD_GATEWAY);
        assert_eq!(success(ProxyMode::HttpConnect).unwrap(), HTTP_ESTABLISHED);
        assert!(success(ProxyMode::HttpForward).is_none());
    }

    #[test]
    fn every_mode_has_a_failure_reply() {
        for mode in ProxyMode::iter() {
            assert!(!failure(mode).is_empty(), "{mode}");
        }
    }

    #[tokio::test]
    async fn writes_to_client() {
        let (mut client, mut proxy) = tokio::io::duplex(64);
        send_success(&mut proxy, ProxyMode::HttpConnect).await.unwrap();
        send_failure(&mut proxy, ProxyMode::Socks5).await;
        drop(proxy);

        let mut got = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut got)
            .await
            .unwrap();
        let mut want = HTTP_ESTABLISHED.to_vec();
        want.extend_from_slice(&[5, 4, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(got, want);
    }
}
