use rand::{thread_rng, RngCore as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_yamux::Control;

/// Upper bound on a single handshake message. Anything larger is not a
/// handshake we ever produce.
const MAX_HANDSHAKE_LEN: usize = 4096;

/// First message on a control connection: the client asks for a subdomain.
/// An empty subdomain means "assign one for me".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subdomain: String,
}

/// Server's reply. A non-empty `error` means registration failed and the
/// connection is closed right after.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeResp {
    pub subdomain: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Server-side record of a live tunnel.
#[derive(Clone)]
pub struct Tunnel {
    /// Random 16-hex-char id, for log correlation only.
    pub id: String,
    pub subdomain: String,
    /// Handle for opening streams on (and closing) the tunnel's session.
    pub control: Control,
}

impl Tunnel {
    pub fn new(subdomain: String, control: Control) -> Self {
        Self {
            id: random_hex(8),
            subdomain,
            control,
        }
    }
}

/// Framing failures on the control connection. Both are fatal for the
/// connection they occur on.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer closed or the transport failed before a complete message
    /// arrived.
    #[error("handshake read failed")]
    Read(#[source] std::io::Error),
    /// The bytes on the wire were not a valid handshake message.
    #[error("handshake decode failed")]
    Decode(#[source] serde_json::Error),
}

pub async fn write_handshake<W>(conn: &mut W, hs: &Handshake) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_json(conn, hs).await
}

pub async fn read_handshake<R>(conn: &mut R) -> Result<Handshake, WireError>
where
    R: AsyncRead + Unpin,
{
    read_json(conn).await
}

pub async fn write_handshake_resp<W>(conn: &mut W, resp: &HandshakeResp) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_json(conn, resp).await
}

pub async fn read_handshake_resp<R>(conn: &mut R) -> Result<HandshakeResp, WireError>
where
    R: AsyncRead + Unpin,
{
    read_json(conn).await
}

async fn write_json<W, T>(conn: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Bare JSON object, no trailing delimiter. The reader stops at the
    // closing brace, so nothing leaks into the multiplex session that takes
    // over the connection afterwards.
    let buf = serde_json::to_vec(value)?;
    conn.write_all(&buf).await?;
    conn.flush().await
}

/// Reads exactly one JSON value, one byte at a time. Never reads past the
/// value, so the connection can be handed to the multiplex layer as-is.
async fn read_json<R, T>(conn: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut buf = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        let n = conn.read(&mut byte).await.map_err(WireError::Read)?;
        if n == 0 {
            return Err(WireError::Read(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-handshake",
            )));
        }
        buf.push(byte[0]);
        if buf.len() > MAX_HANDSHAKE_LEN {
            return Err(WireError::Decode(serde::de::Error::custom(
                "handshake message too large",
            )));
        }
        match serde_json::from_slice::<T>(&buf) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_eof() => continue,
            Err(e) => return Err(WireError::Decode(e)),
        }
    }
}

/// Lowercase hex from the thread-local CSPRNG.
pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
