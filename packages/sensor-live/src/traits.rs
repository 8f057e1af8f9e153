use async_trait::async_trait;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::types::{TopicKey, TransportEvent};

/// Result type for live-data operations
pub type LiveResult<T> = Result<T, LiveError>;

/// Errors that can occur in the live-data layer
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Snapshot rejected: {0}")]
    Snapshot(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No tokio runtime available to drive the transport")]
    NoRuntime,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Callback through which a push connection reports events upstream
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Opens long-lived server-to-client event streams
///
/// Reconnection after transient failures is the transport's job; the
/// multiplexer only ever opens and closes.
pub trait PushTransport: Send + Sync {
    fn open(&self, topic: &TopicKey, sink: EventSink) -> Box<dyn PushConnection>;
}

/// Handle to one open push stream
pub trait PushConnection: Send + Sync {
    /// Stop the stream; no events may be reported after this returns
    fn close(&mut self);
}

/// Request/response transport used by refresh operations
#[async_trait]
pub trait PullTransport: Send + Sync {
    async fn fetch(&self, url: &str) -> LiveResult<serde_json::Value>;
}

/// Entry point that refreshes every view from a full data snapshot
pub trait SnapshotSink: Send + Sync {
    fn apply_snapshot(&self, snapshot: serde_json::Value) -> LiveResult<()>;
}

/// Writable text node of a rendered view
pub trait TextElement {
    fn set_text(&mut self, text: &str);
}

/// Locates rendered elements by id
pub trait ElementLookup: Send {
    type Element: TextElement;

    fn lookup_element_by_id(&self, id: &str) -> Option<Self::Element>;
}

/// The periodic pull operation driven by the refresh scheduler
#[async_trait]
pub trait RefreshOperation: Send + Sync {
    async fn refresh(&self) -> LiveResult<()>;
}

/// Details shown to the user when auto-refresh gives up
#[derive(Debug, Clone, PartialEq)]
pub struct PauseNotice {
    pub error_count: u32,
    pub last_error: String,
}

impl PauseNotice {
    pub fn message(&self) -> String {
        format!(
            "Auto-refresh paused after {} failed attempts ({}). Resume manually to retry.",
            self.error_count, self.last_error
        )
    }
}

/// UI collaborator informed about the scheduler's terminal state
pub trait RefreshNotifier: Send + Sync {
    fn paused(&self, notice: &PauseNotice);

    fn resumed(&self) {}
}
