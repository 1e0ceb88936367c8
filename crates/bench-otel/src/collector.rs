use anyhow::{anyhow, Result};
use bench_core::ArtifactStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use tiny_http::{Response, Server};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceIngestRecord {
    pub timestamp: String,
    pub path: String,
    pub content_type: Option<String>,
    pub authorization: Option<String>,
    pub artifact_ref: String,
    pub size_bytes: usize,
}

/// In-process OTLP/HTTP receiver that stores every payload it receives in
/// an artifact store. Lets a run capture traces without a remote collector.
pub struct LocalCollector {
    pub endpoint: String,
    server: Arc<Server>,
    server_thread: Option<thread::JoinHandle<()>>,
    records: Arc<Mutex<Vec<TraceIngestRecord>>>,
}

impl LocalCollector {
    pub fn start(port: u16, artifact_store: ArtifactStore) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let addr = listener.local_addr()?;
        let server = Arc::new(
            Server::from_listener(listener, None).map_err(|e| anyhow!(e.to_string()))?,
        );
        let endpoint = format!("http://{}:{}", addr.ip(), addr.port());

        let records = Arc::new(Mutex::new(Vec::new()));
        let records_clone = records.clone();
        let server_clone = server.clone();

        let handle = thread::spawn(move || {
            for mut request in server_clone.incoming_requests() {
                let mut content = Vec::new();
                let _ = request.as_reader().read_to_end(&mut content);
                let header = |name: &'static str| {
                    request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv(name))
                        .map(|h| h.value.to_string())
                };
                let content_type = header("Content-Type");
                let authorization = header("Authorization");
                let size = content.len();
                let artifact_ref = artifact_store
                    .put_bytes(&content)
                    .unwrap_or_else(|_| "artifact://sha256/unknown".to_string());
                let record = TraceIngestRecord {
                    timestamp: Utc::now().to_rfc3339(),
                    path: request.url().to_string(),
                    content_type,
                    authorization,
                    artifact_ref,
                    size_bytes: size,
                };
                debug!(path = %record.path, size_bytes = size, "collector received payload");
                if let Ok(mut guard) = records_clone.lock() {
                    guard.push(record);
                }
                let _ = request.respond(Response::from_string("{}"));
            }
        });

        Ok(Self {
            endpoint,
            server,
            server_thread: Some(handle),
            records,
        })
    }

    pub fn records(&self) -> Vec<TraceIngestRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stop(mut self) -> Vec<TraceIngestRecord> {
        self.shutdown();
        self.records()
    }

    fn shutdown(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.server_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LocalCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{setup_otlp, DEFAULT_SERVICE_NAME};
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn collector_receives_spans_from_exporter() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("bench_otel_collector_{}", nanos));
        let collector =
            LocalCollector::start(0, ArtifactStore::new(&root)).expect("collector should start");

        let provider = setup_otlp(
            &collector.endpoint,
            vec![("Authorization".to_string(), "Basic abc".to_string())],
            DEFAULT_SERVICE_NAME,
        )
        .expect("provider");
        let mut span = provider.tracer("bench").start_span("benchmark.task");
        span.set_attribute("task.id", "1");
        span.end();

        let records = collector.stop();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/v1/traces");
        assert_eq!(records[0].authorization.as_deref(), Some("Basic abc"));
        assert!(records[0]
            .content_type
            .as_deref()
            .unwrap_or("")
            .contains("application/json"));

        let store = ArtifactStore::new(&root);
        let body = store.read_ref(&records[0].artifact_ref).expect("payload stored");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json payload");
        assert_eq!(
            payload["resourceSpans"][0]["scopeSpans"][0]["spans"][0]["name"],
            "benchmark.task"
        );
        let _ = fs::remove_dir_all(root);
    }
}
