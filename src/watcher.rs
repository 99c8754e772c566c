/// Log watching: forward server output to the console and pick the server
/// URL out of it.
///
/// The first line that contains `http(s)://host:port` is the ready line.
/// It produces exactly one `DetectedEndpoint` per launch; later URL-shaped
/// lines are forwarded like any other output.
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

/// Scheme, host (or bracketed IPv6 literal), and an explicit port.
static URL_WITH_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(https?)://(\[[^\]]+\]|[^/\s:]+):(\d+)").unwrap());

/// Prefix for every line this tool prints on its own behalf.
pub const CONSOLE_PREFIX: &str = "[ComfyUI]";

/// The address a server reported once it was ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for DetectedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Find the first `scheme://host:port` in a line.
///
/// A port that does not fit in a u16 is not a match.
pub fn detect_endpoint(line: &str) -> Option<DetectedEndpoint> {
    URL_WITH_PORT.captures_iter(line).find_map(|caps| {
        let port = caps[3].parse::<u16>().ok()?;
        Some(DetectedEndpoint {
            scheme: caps[1].to_string(),
            host: caps[2].to_string(),
            port,
        })
    })
}

/// Where forwarded output and status lines go.
pub trait ConsoleSink: Send + Sync {
    fn line(&self, text: &str);
}

/// Writes every line to stdout.
pub struct StdoutSink;

impl ConsoleSink for StdoutSink {
    fn line(&self, text: &str) {
        println!("{text}");
    }
}

/// Print a tool status line, e.g. `[ComfyUI] Server already running.`
pub fn status(sink: &dyn ConsoleSink, message: &str) {
    sink.line(&format!("{CONSOLE_PREFIX} {message}"));
}

/// Per-session detection state.
#[derive(Debug, Default)]
pub struct LogWatcher {
    endpoint: Option<DetectedEndpoint>,
    lines: u64,
}

impl LogWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line. Returns the endpoint only on the line that first
    /// reveals it; afterwards no extraction is attempted.
    pub fn observe(&mut self, line: &str) -> Option<&DetectedEndpoint> {
        self.lines += 1;
        if self.endpoint.is_some() {
            return None;
        }
        self.endpoint = Some(detect_endpoint(line)?);
        self.endpoint.as_ref()
    }

    #[cfg(test)]
    pub fn endpoint(&self) -> Option<&DetectedEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn into_summary(self) -> WatchSummary {
        WatchSummary {
            lines: self.lines,
            endpoint: self.endpoint,
        }
    }
}

/// What a watch saw by the time the output stream closed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchSummary {
    pub lines: u64,
    pub endpoint: Option<DetectedEndpoint>,
}

/// Drain `lines` until it ends, forwarding each line unchanged to `sink`.
///
/// On the ready line, prints `[ComfyUI] Server running at: <url>` and sends
/// the endpoint through `notify` if one was given. Running out of input
/// without a match is a normal outcome.
pub async fn watch<S>(
    mut lines: S,
    sink: Arc<dyn ConsoleSink>,
    mut notify: Option<oneshot::Sender<DetectedEndpoint>>,
) -> WatchSummary
where
    S: Stream<Item = String> + Unpin,
{
    let mut watcher = LogWatcher::new();

    while let Some(line) = lines.next().await {
        sink.line(&line);

        if let Some(endpoint) = watcher.observe(&line) {
            tracing::info!(url = %endpoint, "server ready line detected");
            status(sink.as_ref(), &format!("Server running at: {endpoint}"));
            if let Some(tx) = notify.take() {
                // Receiver may already be gone; nothing to do then.
                let _ = tx.send(endpoint.clone());
            }
        }
    }

    let summary = watcher.into_summary();
    tracing::debug!(
        lines = summary.lines,
        ready = summary.endpoint.is_some(),
        "output stream closed"
    );
    summary
}

/// Read `reader` line by line into `tx` until EOF or a read error.
///
/// Line terminators are stripped and invalid UTF-8 is replaced rather than
/// ending the stream.
pub fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>, name: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(|c: char| c == '\n' || c == '\r')
                        .to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(stream = name, error = %e, "output read failed, closing stream");
                    break;
                }
            }
        }
        tracing::debug!(stream = name, "output stream reached EOF");
    })
}

/// Merge stdout and stderr into one line stream, in arrival order.
///
/// The stream ends once both pipes have closed.
pub fn combined_output<O, E>(stdout: O, stderr: E) -> ReceiverStream<String>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1024);
    spawn_line_reader(stdout, tx.clone(), "stdout");
    spawn_line_reader(stderr, tx, "stderr");
    ReceiverStream::new(rx)
}

/// Captures console output in memory.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemorySink {
    lines: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemorySink {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl ConsoleSink for MemorySink {
    fn line(&self, text: &str) {
        self.lines.lock().unwrap().push(text.to_string());
    }
}
