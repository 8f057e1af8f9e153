//! Server-Sent Events push transport.
//!
//! Each opened connection is a task that keeps one `text/event-stream`
//! request alive and reconnects after failures, the way a browser
//! `EventSource` does. The multiplexer above never retries on its own.

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::LiveConfig;
use crate::traits::{EventSink, LiveError, LiveResult, PushConnection, PushTransport};
use crate::types::{TopicKey, TransportEvent, DEFAULT_EVENT_TYPE};

const LAST_EVENT_ID: &str = "Last-Event-ID";

/// One dispatched server event
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event_type: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser
///
/// Accepts arbitrary byte chunks; lines may be split across chunks and end
/// with LF, CR or CRLF.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    skip_lf: bool,
    event_type: Option<String>,
    data: String,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the response body, returning every completed event
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut frames),
                b'\r' => {
                    self.end_line(&mut frames);
                    self.skip_lf = true;
                }
                _ => self.line.push(byte),
            }
        }
        frames
    }

    /// Id of the last event seen, sent back as `Last-Event-ID` on reconnect
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection delay requested by the server
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Discard a partially received event before reconnecting
    pub fn reset_stream(&mut self) {
        self.line.clear();
        self.skip_lf = false;
        self.event_type = None;
        self.data.clear();
    }

    fn end_line(&mut self, frames: &mut Vec<SseFrame>) {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();

        if line.is_empty() {
            if let Some(frame) = self.dispatch() {
                frames.push(frame);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line.as_str(), ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event_type = self.event_type.take();
        if self.data.is_empty() {
            return None;
        }

        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }

        Some(SseFrame {
            event_type: event_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data,
            id: self.last_event_id.clone(),
        })
    }
}

/// Push transport over HTTP Server-Sent Events
#[derive(Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    url_template: String,
    retry: Duration,
    runtime: Handle,
}

impl SseTransport {
    /// Create a transport bound to the current tokio runtime
    pub fn new(url_template: impl Into<String>, retry: Duration) -> LiveResult<Self> {
        let runtime = Handle::try_current().map_err(|_| LiveError::NoRuntime)?;
        // No request timeout: the stream is meant to stay open
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            client,
            url_template: url_template.into(),
            retry,
            runtime,
        })
    }

    pub fn from_config(config: &LiveConfig) -> LiveResult<Self> {
        Self::new(config.stream_url.clone(), config.sse_retry)
    }

    /// Resolve the stream URL for a topic
    pub fn stream_url(&self, topic: &str) -> String {
        if self.url_template.contains("{topic}") {
            self.url_template.replace("{topic}", topic)
        } else {
            format!("{}/{}", self.url_template.trim_end_matches('/'), topic)
        }
    }
}

impl PushTransport for SseTransport {
    fn open(&self, topic: &TopicKey, sink: EventSink) -> Box<dyn PushConnection> {
        let url = self.stream_url(topic);
        info!("Connecting event stream {}", url);
        let task = self
            .runtime
            .spawn(run_event_stream(self.client.clone(), url, self.retry, sink));

        Box::new(SseConnection { task: Some(task) })
    }
}

struct SseConnection {
    task: Option<JoinHandle<()>>,
}

impl PushConnection for SseConnection {
    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Keep one event stream alive until aborted
async fn run_event_stream(client: reqwest::Client, url: String, default_retry: Duration, sink: EventSink) {
    let mut decoder = SseDecoder::new();

    loop {
        let mut request = client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = decoder.last_event_id() {
            request = request.header(LAST_EVENT_ID, id);
        }

        match request.send().await {
            Ok(response) if response.status() == StatusCode::NO_CONTENT => {
                info!("Event stream {} answered 204, not reconnecting", url);
                sink(TransportEvent::Error(format!("{} closed the stream (204)", url)));
                return;
            }
            Ok(response) if response.status().is_success() => {
                sink(TransportEvent::Open);
                let mut body = response.bytes_stream();
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(bytes) => {
                            for frame in decoder.feed(&bytes) {
                                sink(TransportEvent::Event {
                                    event_type: frame.event_type,
                                    data: frame.data,
                                    id: frame.id,
                                });
                            }
                        }
                        Err(e) => {
                            sink(TransportEvent::Error(format!("stream read failed: {}", e)));
                            break;
                        }
                    }
                }
                debug!("Event stream {} ended", url);
                sink(TransportEvent::Error("stream ended".to_string()));
            }
            Ok(response) => {
                sink(TransportEvent::Error(format!(
                    "unexpected status {} from {}",
                    response.status(),
                    url
                )));
            }
            Err(e) => {
                sink(TransportEvent::Error(format!("connect failed: {}", e)));
            }
        }

        decoder.reset_stream();
        let delay = decoder.retry().unwrap_or(default_retry);
        debug!("Reconnecting event stream {} in {:?}", url, delay);
        tokio::time::sleep(delay).await;
    }
}
