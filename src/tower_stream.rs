//! The tower simulator's long-lived streaming channel (§4.1): a
//! line-delimited feed of keep-alive comments and snapshot records, read
//! independently of the request/response operations in [`crate::tower_client`].
//!
//! This is kept as its own trait-object seam, the same way `TowerClient` and
//! `Sleeper` are, so [`crate::tower_bridge::TowerBridge`] can be driven end to
//! end against a scripted double in tests instead of a real simulator.

use crate::model::Snapshot;
use crate::tower_client::TowerClientError;
use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;

/// One line read off the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    KeepAlive,
    Snapshot(Snapshot),
}

/// A snapshot record normalized to one shape regardless of whether the
/// simulator wraps it as `{state: ...}` or sends the bare object (§4.1).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SnapshotEnvelope {
    Wrapped { state: Snapshot },
    Bare(Snapshot),
}

impl SnapshotEnvelope {
    fn into_snapshot(self) -> Snapshot {
        match self {
            SnapshotEnvelope::Wrapped { state } => state,
            SnapshotEnvelope::Bare(snapshot) => snapshot,
        }
    }
}

/// Parse one line of the channel: a blank line or a `:`-prefixed comment is a
/// keep-alive, anything else is expected to decode as a snapshot envelope.
fn parse_line(line: &str) -> Result<StreamMessage, TowerClientError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(StreamMessage::KeepAlive);
    }
    serde_json::from_str::<SnapshotEnvelope>(line)
        .map(|env| StreamMessage::Snapshot(env.into_snapshot()))
        .map_err(|e| TowerClientError::Decode(e.to_string()))
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<StreamMessage, TowerClientError>> + Send>>;

/// Opens the simulator's streaming channel. A connection is one attempt: the
/// returned stream ends (or yields an `Err`) on disconnect, and the caller is
/// expected to call `connect` again to reconnect.
#[async_trait]
pub trait TowerStreamSource: Send + Sync {
    async fn connect(&self) -> Result<MessageStream, TowerClientError>;
}

/// `reqwest`-backed streaming source: opens the configured stream URL and
/// decodes its line-delimited body as bytes arrive.
pub struct HttpTowerStreamSource {
    http: reqwest::Client,
    url: String,
}

impl HttpTowerStreamSource {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl TowerStreamSource for HttpTowerStreamSource {
    async fn connect(&self) -> Result<MessageStream, TowerClientError> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| TowerClientError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TowerClientError::Http { status: resp.status().as_u16() });
        }

        let mut bytes = resp.bytes_stream();
        let lines = async_stream::stream! {
            let mut buf = String::new();
            loop {
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buf.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buf.find('\n') {
                            let line: String = buf.drain(..=pos).collect();
                            yield parse_line(line.trim_end_matches('\n'));
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(TowerClientError::Transport(e.to_string()));
                        return;
                    }
                    None => return,
                }
            }
        };
        Ok(Box::pin(lines))
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A `TowerStreamSource` that hands out scripted connection attempts in
    /// order: each is either a message list (ending the stream once drained,
    /// simulating a disconnect) or a connect failure.
    pub struct ScriptedStreamSource {
        attempts: Mutex<VecDeque<Result<Vec<StreamMessage>, TowerClientError>>>,
    }

    impl ScriptedStreamSource {
        pub fn new(attempts: Vec<Result<Vec<StreamMessage>, TowerClientError>>) -> Self {
            Self { attempts: Mutex::new(attempts.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl TowerStreamSource for ScriptedStreamSource {
        async fn connect(&self) -> Result<MessageStream, TowerClientError> {
            let next =
                self.attempts.lock().expect("scripted stream mutex poisoned").pop_front().ok_or_else(|| {
                    TowerClientError::Transport("scripted stream source has no attempts left".to_string())
                })?;
            match next {
                Ok(messages) => Ok(Box::pin(futures_util::stream::iter(messages.into_iter().map(Ok)))),
                Err(e) => Err(e),
            }
        }
    }
}
