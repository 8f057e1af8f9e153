use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::LiveConfig;
use crate::traits::{LiveError, LiveResult, PullTransport, RefreshOperation, SnapshotSink};

/// JSON-over-HTTP pull transport
#[derive(Clone)]
pub struct HttpPull {
    client: reqwest::Client,
}

impl HttpPull {
    pub fn new(timeout: Duration) -> LiveResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn from_config(config: &LiveConfig) -> LiveResult<Self> {
        Self::new(config.request_timeout)
    }
}

#[async_trait]
impl PullTransport for HttpPull {
    async fn fetch(&self, url: &str) -> LiveResult<serde_json::Value> {
        debug!("Fetching snapshot from {}", url);
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(LiveError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response.json::<serde_json::Value>().await?)
    }
}

/// Refresh operation that pulls a full snapshot and hands it to the views
pub struct FetchAndApply {
    transport: Arc<dyn PullTransport>,
    url: String,
    sink: Arc<dyn SnapshotSink>,
}

impl FetchAndApply {
    pub fn new(transport: Arc<dyn PullTransport>, url: impl Into<String>, sink: Arc<dyn SnapshotSink>) -> Self {
        Self {
            transport,
            url: url.into(),
            sink,
        }
    }
}

#[async_trait]
impl RefreshOperation for FetchAndApply {
    async fn refresh(&self) -> LiveResult<()> {
        let snapshot = self.transport.fetch(&self.url).await?;
        self.sink.apply_snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct StaticPull {
        response: Mutex<Option<LiveResult<serde_json::Value>>>,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PullTransport for StaticPull {
        async fn fetch(&self, url: &str) -> LiveResult<serde_json::Value> {
            self.requested.lock().push(url.to_string());
            self.response
                .lock()
                .take()
                .unwrap_or_else(|| Err(LiveError::Internal("no response".to_string())))
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        snapshots: Mutex<Vec<serde_json::Value>>,
    }

    impl SnapshotSink for CapturingSink {
        fn apply_snapshot(&self, snapshot: serde_json::Value) -> LiveResult<()> {
            if snapshot.is_null() {
                return Err(LiveError::Snapshot("empty snapshot".to_string()));
            }
            self.snapshots.lock().push(snapshot);
            Ok(())
        }
    }

    fn pull(response: LiveResult<serde_json::Value>) -> Arc<StaticPull> {
        Arc::new(StaticPull {
            response: Mutex::new(Some(response)),
            requested: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_snapshot_is_handed_to_sink() {
        let transport = pull(Ok(serde_json::json!([{ "sensorId": "s1", "value": 3 }])));
        let sink = Arc::new(CapturingSink::default());
        let op = FetchAndApply::new(transport.clone(), "http://host/api/snapshot", sink.clone());

        op.refresh().await.unwrap();

        assert_eq!(*transport.requested.lock(), vec!["http://host/api/snapshot".to_string()]);
        assert_eq!(sink.snapshots.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_a_refresh_failure() {
        let transport = pull(Err(LiveError::Status {
            status: 503,
            url: "http://host/api/snapshot".to_string(),
        }));
        let sink = Arc::new(CapturingSink::default());
        let op = FetchAndApply::new(transport, "http://host/api/snapshot", sink.clone());

        assert!(matches!(op.refresh().await, Err(LiveError::Status { status: 503, .. })));
        assert!(sink.snapshots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_snapshot_is_a_refresh_failure() {
        let transport = pull(Ok(serde_json::Value::Null));
        let op = FetchAndApply::new(transport, "http://host/api/snapshot", Arc::new(CapturingSink::default()));

        assert!(matches!(op.refresh().await, Err(LiveError::Snapshot(_))));
    }
}
