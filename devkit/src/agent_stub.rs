/*!
Stub discovery agent listening on a real TCP socket

Answers framed requests from a scripted key/value table and records every key
it was asked. Unknown keys get the not-supported sentinel, like a real agent.
*/

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use virtsync_core::protocol::{AgentClient, HEADER_LEN, MAGIC, NOT_SUPPORTED_PREFIX, PROTOCOL_VERSION};

/// Reply framing used by the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Framed,
    /// Payload written without header, as some older agents do.
    Raw,
}

#[derive(Default)]
struct AgentState {
    answers: HashMap<String, String>,
    queries: Vec<String>,
}

pub struct StubAgent {
    addr: SocketAddr,
    state: Arc<Mutex<AgentState>>,
    mode: Arc<Mutex<ReplyMode>>,
    task: JoinHandle<()>,
}

impl StubAgent {
    /// Binds an ephemeral local port and starts serving.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(AgentState::default()));
        let mode = Arc::new(Mutex::new(ReplyMode::Framed));

        let task = {
            let state = state.clone();
            let mode = mode.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let state = state.clone();
                    let mode = *mode.lock();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, state, mode).await {
                            log::warn!("[stub-agent] connection error: {}", e);
                        }
                    });
                }
            })
        };

        log::info!("[stub-agent] listening on {}", addr);
        Ok(Self { addr, state, mode, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client configured for this stub.
    pub fn client(&self) -> AgentClient {
        AgentClient::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn set_reply_mode(&self, mode: ReplyMode) {
        *self.mode.lock() = mode;
    }

    pub fn answer(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        self.state.lock().answers.insert(key.into(), value.into());
        self
    }

    pub fn forget(&self, key: &str) {
        self.state.lock().answers.remove(key);
    }

    /// Every key received, in arrival order.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().queries.clone()
    }

    pub fn queries_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .queries
            .iter()
            .filter(|q| q.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_queries(&self) {
        self.state.lock().queries.clear();
    }
}

impl Drop for StubAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<AgentState>>, mode: ReplyMode) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    if header[..4] != MAGIC[..] {
        anyhow::bail!("request without protocol header");
    }

    let mut len = [0u8; 8];
    len.copy_from_slice(&header[5..13]);
    let mut key = vec![0u8; u64::from_le_bytes(len) as usize];
    stream.read_exact(&mut key).await?;
    let key = String::from_utf8_lossy(&key).trim_end_matches('\n').to_string();

    let answer = {
        let mut state = state.lock();
        state.queries.push(key.clone());
        state
            .answers
            .get(&key)
            .cloned()
            .unwrap_or_else(|| format!("{NOT_SUPPORTED_PREFIX}\0Unsupported item key."))
    };
    log::debug!("[stub-agent] {} -> {} bytes", key, answer.len());

    let reply = match mode {
        ReplyMode::Framed => frame(answer.as_bytes()),
        ReplyMode::Raw => answer.into_bytes(),
    };
    stream.write_all(&reply).await?;
    stream.shutdown().await?;
    Ok(())
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtsync_core::protocol::AgentQuery;

    #[tokio::test]
    async fn test_answers_and_records_queries() {
        let agent = StubAgent::start().await.unwrap();
        agent.answer("vm.powerstate[k1]", "poweredOn");
        let client = agent.client();

        assert_eq!(client.query("vm.powerstate[k1]").await.unwrap(), "poweredOn");
        assert!(client.query("vm.unknown[k1]").await.unwrap().starts_with(NOT_SUPPORTED_PREFIX));

        agent.set_reply_mode(ReplyMode::Raw);
        assert_eq!(client.query("vm.powerstate[k1]").await.unwrap(), "poweredOn");

        assert_eq!(agent.queries(), vec!["vm.powerstate[k1]", "vm.unknown[k1]", "vm.powerstate[k1]"]);
    }
}
