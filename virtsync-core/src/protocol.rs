//! Discovery agent protocol client
//!
//! Minimal length-prefixed request/response exchange with a discovery agent:
//! - One fresh TCP connection per query, closed on every exit path
//! - Request = `MAGIC || VERSION || LEN (u64 LE) || "<key>\n"`
//! - Response is unframed when it carries the same header, returned raw otherwise

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Frame magic tag.
pub const MAGIC: &[u8; 4] = b"ZBXD";
/// Frame protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;
/// Magic (4) + version (1) + payload length (8).
pub const HEADER_LEN: usize = 13;
/// Prefix the agent answers with when a key is unknown or failed.
pub const NOT_SUPPORTED_PREFIX: &str = "ZBX_NOTSUPPORTED";
pub const DEFAULT_AGENT_PORT: u16 = 10050;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("query key must not contain a newline: {0:?}")]
    InvalidKey(String),
    #[error("cannot connect to agent {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {secs}s while {stage} agent {target}")]
    Timeout {
        target: String,
        stage: &'static str,
        secs: u64,
    },
    #[error("i/o error with agent {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: usize },
}

/// Anything able to answer a discovery or attribute key with text.
#[async_trait]
pub trait AgentQuery: Send + Sync {
    async fn query(&self, key: &str) -> Result<String, ProtocolError>;
}

/// Wraps `key` into a request frame.
pub fn encode_request(key: &str) -> Result<Vec<u8>, ProtocolError> {
    if key.contains('\n') {
        return Err(ProtocolError::InvalidKey(key.to_string()));
    }

    let payload_len = key.len() + 1;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len);
    frame.extend_from_slice(MAGIC);
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&(payload_len as u64).to_le_bytes());
    frame.extend_from_slice(key.as_bytes());
    frame.push(b'\n');
    Ok(frame)
}

/// True when `raw` starts with `MAGIC || VERSION`.
pub fn is_framed(raw: &[u8]) -> bool {
    raw.len() > MAGIC.len() && raw.starts_with(MAGIC) && raw[MAGIC.len()] == PROTOCOL_VERSION
}

/// Extracts the payload of a framed response, or returns raw bytes verbatim.
pub fn decode_response(raw: &[u8]) -> Result<String, ProtocolError> {
    if !is_framed(raw) {
        return Ok(String::from_utf8_lossy(raw).into_owned());
    }
    if raw.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN as u64,
            actual: raw.len(),
        });
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&raw[5..HEADER_LEN]);
    let payload_len = u64::from_le_bytes(len_bytes);

    let available = (raw.len() - HEADER_LEN) as u64;
    if available < payload_len {
        return Err(ProtocolError::Truncated {
            expected: payload_len,
            actual: raw.len() - HEADER_LEN,
        });
    }

    let end = HEADER_LEN + payload_len as usize;
    Ok(String::from_utf8_lossy(&raw[HEADER_LEN..end]).into_owned())
}

/// TCP client for a single discovery agent.
#[derive(Debug, Clone)]
pub struct AgentClient {
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl AgentClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn exchange(&self, frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let target = self.target();

        let mut stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| ProtocolError::Timeout {
            target: target.clone(),
            stage: "connecting to",
            secs: self.connect_timeout.as_secs(),
        })?
        .map_err(|source| ProtocolError::Connect {
            target: target.clone(),
            source,
        })?;

        stream
            .write_all(frame)
            .await
            .map_err(|source| ProtocolError::Io {
                target: target.clone(),
                source,
            })?;

        // The agent closes the connection once the answer is written.
        let mut response = Vec::new();
        timeout(self.read_timeout, stream.read_to_end(&mut response))
            .await
            .map_err(|_| ProtocolError::Timeout {
                target: target.clone(),
                stage: "reading from",
                secs: self.read_timeout.as_secs(),
            })?
            .map_err(|source| ProtocolError::Io { target, source })?;

        Ok(response)
    }
}

#[async_trait]
impl AgentQuery for AgentClient {
    async fn query(&self, key: &str) -> Result<String, ProtocolError> {
        let frame = encode_request(key)?;
        debug!(agent = %self.target(), key, "agent query");

        let raw = self.exchange(&frame).await?;
        let payload = decode_response(&raw)?;
        trace!(key, bytes = raw.len(), framed = is_framed(&raw), "agent answered");
        Ok(payload)
    }
}
