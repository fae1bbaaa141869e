use super::connection::{Connection, MessageVariant};
use crate::word_source::{ReadError, WordRead, WordSource};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

/// Parse a tag value as an alarm word.
///
/// Accepts unsigned decimal, `0x` prefixed hex and signed 32-bit values,
/// the latter reinterpreted bit for bit.
pub fn parse_word(value: &str) -> Result<u32, ReadError> {
    let value = value.trim();
    let parsed = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value
            .parse::<u32>()
            .ok()
            .or_else(|| value.parse::<i32>().ok().map(|v| v as u32))
    };
    parsed.ok_or_else(|| ReadError::Parse(value.to_string()))
}

/// Name of the tag holding a word. `{}` in the pattern is replaced by the
/// word index, without it the index is appended.
pub fn tag_name(pattern: &str, word_index: usize) -> String {
    if pattern.contains("{}") {
        pattern.replace("{}", &word_index.to_string())
    } else {
        format!("{}{}", pattern, word_index)
    }
}

struct PipeState {
    conn: Option<Connection>,
    connected_before: bool,
}

struct PipeInner {
    path: String,
    tag_pattern: String,
    read_timeout: Duration,
    state: Mutex<PipeState>,
    session: AtomicU64,
}

/// Reads alarm words as tags through the HMI runtime's Open Pipe.
///
/// The pipe is connected on first use and reconnected after it has been
/// lost. Each reconnect starts a new session.
#[derive(Clone)]
pub struct PipeWordSource {
    inner: Arc<PipeInner>,
}

impl PipeWordSource {
    pub fn new(path: &str, tag_pattern: &str, read_timeout: Duration) -> PipeWordSource {
        PipeWordSource {
            inner: Arc::new(PipeInner {
                path: path.to_string(),
                tag_pattern: tag_pattern.to_string(),
                read_timeout,
                state: Mutex::new(PipeState {
                    conn: None,
                    connected_before: false,
                }),
                session: AtomicU64::new(0),
            }),
        }
    }

    /// Drop the connection to the runtime
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if state.conn.take().is_some() {
            debug!("Closed Open Pipe connection to {}", self.inner.path);
        }
    }
}

impl PipeInner {
    async fn ensure_connected(&self, state: &mut PipeState) -> Result<(), ReadError> {
        if state.conn.is_some() {
            return Ok(());
        }
        match Connection::connect(&self.path).await {
            Ok(conn) => {
                info!("Connected to {}", self.path);
                state.conn = Some(conn);
                if state.connected_before {
                    self.session.fetch_add(1, Ordering::AcqRel);
                }
                state.connected_before = true;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.path, e);
                Err(ReadError::Disconnected)
            }
        }
    }

    async fn wait_reply(
        conn: &mut Connection,
        tag: &str,
        cookie: &str,
    ) -> Result<u32, ReadError> {
        loop {
            let msg = conn.get_message().await.ok_or(ReadError::Disconnected)?;
            if msg.client_cookie != cookie {
                debug!("Discarding reply for {}", msg.client_cookie);
                continue;
            }
            match msg.message {
                MessageVariant::NotifyReadTag(notify) => {
                    let tag_reply = notify
                        .params
                        .tags
                        .into_iter()
                        .find(|t| t.data.name == tag)
                        .ok_or_else(|| ReadError::Failed(format!("No value for {}", tag)))?;
                    if tag_reply.error.error_code != 0 {
                        return Err(ReadError::Failed(tag_reply.error.to_string()));
                    }
                    return parse_word(&tag_reply.data.value);
                }
                MessageVariant::ErrorReadTag(error) => {
                    return Err(ReadError::Failed(error.to_string()));
                }
                _ => {}
            }
        }
    }

    async fn read_word(&self, word_index: usize) -> Result<u32, ReadError> {
        let tag = tag_name(&self.tag_pattern, word_index);
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await?;
        // Held outside the state while in use, a read abandoned halfway
        // drops the connection instead of leaving a partial request behind
        let mut conn = state.conn.take().ok_or(ReadError::Disconnected)?;
        let cookie = conn.read_tags(&[tag.as_str()]).await.map_err(|e| {
            warn!("Failed to send tag request: {}", e);
            ReadError::Disconnected
        })?;
        let reply = Self::wait_reply(&mut conn, &tag, &cookie);
        let res = match timeout(self.read_timeout, reply).await {
            Ok(res) => res,
            // A late reply is discarded by its cookie
            Err(_) => Err(ReadError::Timeout),
        };
        if res != Err(ReadError::Disconnected) {
            state.conn = Some(conn);
        }
        res
    }
}

impl WordSource for PipeWordSource {
    fn read(&self, word_index: usize) -> WordRead {
        let inner = self.inner.clone();
        Box::pin(async move { inner.read_word(word_index).await })
    }

    fn session(&self) -> u64 {
        self.inner.session.load(Ordering::Acquire)
    }
}

#[test]
fn test_parse_word() {
    assert_eq!(parse_word("4096"), Ok(4096));
    assert_eq!(parse_word(" 4294967295 "), Ok(u32::MAX));
    assert_eq!(parse_word("-1"), Ok(u32::MAX));
    assert_eq!(parse_word("0x8000_0000"), Err(ReadError::Parse("0x8000_0000".to_string())));
    assert_eq!(parse_word("0x80000000"), Ok(0x8000_0000));
    assert_eq!(parse_word("TRUE"), Err(ReadError::Parse("TRUE".to_string())));
    assert_eq!(parse_word(""), Err(ReadError::Parse("".to_string())));
}

#[test]
fn test_tag_name() {
    assert_eq!(tag_name("AlarmWord_{}", 3), "AlarmWord_3");
    assert_eq!(tag_name("Alarms[{}]", 27), "Alarms[27]");
    assert_eq!(tag_name("HMI_Alarm", 0), "HMI_Alarm0");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};

    // Answer ReadTag requests with the tag's index times 16
    async fn serve(stream: UnixStream, mut remaining: usize) {
        let (r, mut w) = stream.into_split();
        let mut lines = BufReader::new(r).lines();
        while remaining > 0 {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => break,
            };
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            let name = request["Params"]["Tags"][0].as_str().unwrap().to_string();
            let index: u32 = name.trim_start_matches("Word").parse().unwrap();
            let cookie = request["ClientCookie"].as_str().unwrap();
            // Unrelated traffic first
            let stale = "{\"Message\":\"ErrorReadTag\",\"ErrorCode\":1,\"ErrorDescription\":\"x\",\"ClientCookie\":\"other\"}\n";
            w.write_all(stale.as_bytes()).await.unwrap();
            let reply = format!(
                "{{\"Message\":\"NotifyReadTag\",\"Params\":{{\"Tags\":[{{\"Name\":\"{}\",\"Value\":\"{}\",\"Quality\":\"Good\",\"QualityCode\":192,\"TimeStamp\":\"\",\"ErrorCode\":0,\"ErrorDescription\":\"\"}}]}},\"ClientCookie\":\"{}\"}}\n",
                name,
                index * 16,
                cookie
            );
            w.write_all(reply.as_bytes()).await.unwrap();
            remaining -= 1;
        }
    }

    // With more than one connection each but the last is closed after one request
    async fn fake_runtime(listener: UnixListener, connections: usize) {
        for n in 0..connections {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let remaining = if n + 1 < connections { 1 } else { usize::MAX };
            serve(stream, remaining).await;
        }
    }

    // First connection swallows requests without answering
    async fn stalled_runtime(listener: UnixListener) {
        let (first, _) = match listener.accept().await {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let mut lines = BufReader::new(first).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
        });
        if let Ok((second, _)) = listener.accept().await {
            serve(second, usize::MAX).await;
        }
    }

    fn socket_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("alarm_monitor_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test_log::test(tokio::test)]
    async fn read_through_pipe() {
        let path = socket_path("pipe_read");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_runtime(listener, 1));

        let source = PipeWordSource::new(path.to_str().unwrap(), "Word{}", Duration::from_secs(2));
        assert_eq!(source.read(3).await, Ok(48));
        assert_eq!(source.read(5).await, Ok(80));
        assert_eq!(source.session(), 0);
        source.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[test_log::test(tokio::test)]
    async fn reconnect_bumps_session() {
        let path = socket_path("pipe_reconnect");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_runtime(listener, 2));

        let source = PipeWordSource::new(path.to_str().unwrap(), "Word{}", Duration::from_secs(2));
        assert_eq!(source.read(1).await, Ok(16));
        // The runtime closed the first connection
        assert_eq!(source.read(2).await, Err(ReadError::Disconnected));
        assert_eq!(source.read(2).await, Ok(32));
        assert_eq!(source.session(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test_log::test(tokio::test)]
    async fn timeout_keeps_connection() {
        let path = socket_path("pipe_timeout");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(stalled_runtime(listener));

        let source = PipeWordSource::new(path.to_str().unwrap(), "Word{}", Duration::from_millis(50));
        assert_eq!(source.read(1).await, Err(ReadError::Timeout));
        assert_eq!(source.read(1).await, Err(ReadError::Timeout));
        assert_eq!(source.session(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test_log::test(tokio::test)]
    async fn abandoned_read_reconnects() {
        let path = socket_path("pipe_abandoned");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(stalled_runtime(listener));

        let source = PipeWordSource::new(path.to_str().unwrap(), "Word{}", Duration::from_secs(2));
        // Dropped by the caller before any reply arrives
        assert!(timeout(Duration::from_millis(50), source.read(1)).await.is_err());
        assert_eq!(source.read(2).await, Ok(32));
        assert_eq!(source.session(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unreachable_runtime() {
        let source = PipeWordSource::new("/nonexistent/alarm_monitor/pipe", "Word{}", Duration::from_millis(100));
        assert_eq!(source.read(0).await, Err(ReadError::Disconnected));
    }
}
