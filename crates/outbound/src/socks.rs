//! Client side of a SOCKS5 CONNECT (RFC 1928), no authentication.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DialError;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

fn io_error(err: std::io::Error) -> DialError {
    DialError::SocksProtocol(err.to_string())
}

/// Ask the proxy on `stream` to connect to `host:port`. The host is always
/// sent as a domain name so hidden-service names resolve at the proxy.
pub(crate) async fn connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host_len = u8::try_from(host.len())
        .map_err(|_| DialError::SocksProtocol(format!("host name too long: {host}")))?;

    stream
        .write_all(&[VERSION, 1, NO_AUTH])
        .await
        .map_err(io_error)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(io_error)?;
    if choice[0] != VERSION {
        return Err(DialError::SocksProtocol(format!("unexpected version {}", choice[0])));
    }
    match choice[1] {
        NO_AUTH => {}
        NO_ACCEPTABLE_METHODS => {
            return Err(DialError::SocksProtocol("proxy requires authentication".into()));
        }
        other => {
            return Err(DialError::SocksProtocol(format!("proxy chose unoffered method {other}")));
        }
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host_len]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(io_error)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(io_error)?;
    if head[0] != VERSION {
        return Err(DialError::SocksProtocol(format!("unexpected version {}", head[0])));
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(DialError::SocksRefused { reply: head[1] });
    }

    // Bound address, unused.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_error)?;
            usize::from(len[0])
        }
        other => {
            return Err(DialError::SocksProtocol(format!("unknown address type {other}")));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await.map_err(io_error)?;

    Ok(())
}
