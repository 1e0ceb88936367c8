use anyhow::{anyhow, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::tracer::{AttributeValue, SpanData, SpanProcessor};

const OTLP_TRACES_PATH: &str = "v1/traces";
const EXPORT_TIMEOUT_MS: u64 = 10_000;
const SPAN_KIND_INTERNAL: u8 = 1;

pub trait SpanExporter: Send + Sync {
    fn export(&self, spans: &[SpanData]) -> Result<()>;
}

fn encode_attribute_value(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::String(s) => json!({ "stringValue": s }),
        // proto3 JSON mapping carries int64 as a decimal string
        AttributeValue::Int(i) => json!({ "intValue": i.to_string() }),
        AttributeValue::Double(d) => json!({ "doubleValue": d }),
        AttributeValue::Bool(b) => json!({ "boolValue": b }),
    }
}

fn encode_attributes(attributes: &[(String, AttributeValue)]) -> Value {
    Value::Array(
        attributes
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": encode_attribute_value(value) }))
            .collect(),
    )
}

fn encode_span(span: &SpanData) -> Value {
    let mut out = json!({
        "traceId": span.trace_id,
        "spanId": span.span_id,
        "name": span.name,
        "kind": SPAN_KIND_INTERNAL,
        "startTimeUnixNano": span.start_unix_nano.to_string(),
        "endTimeUnixNano": span.end_unix_nano.to_string(),
        "attributes": encode_attributes(&span.attributes),
        "status": {
            "code": span.status.otlp_code(),
        },
    });
    if let Some(parent) = span.parent_span_id.as_ref() {
        out["parentSpanId"] = json!(parent);
    }
    if let Some(message) = span.status_message.as_ref() {
        out["status"]["message"] = json!(message);
    }
    out
}

/// Builds an OTLP/JSON `ExportTraceServiceRequest`, grouping spans by
/// instrumentation scope.
pub fn encode_export_request(service_name: &str, spans: &[SpanData]) -> Value {
    let mut by_scope: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for span in spans {
        by_scope
            .entry(span.scope.as_str())
            .or_default()
            .push(encode_span(span));
    }
    let scope_spans: Vec<Value> = by_scope
        .into_iter()
        .map(|(scope, spans)| {
            json!({
                "scope": { "name": scope, "version": env!("CARGO_PKG_VERSION") },
                "spans": spans,
            })
        })
        .collect();
    json!({
        "resourceSpans": [{
            "resource": {
                "attributes": encode_attributes(&[(
                    "service.name".to_string(),
                    AttributeValue::String(service_name.to_string()),
                )]),
            },
            "scopeSpans": scope_spans,
        }]
    })
}

pub struct OtlpHttpExporter {
    traces_url: String,
    headers: Vec<(String, String)>,
    service_name: String,
    client: HttpClient,
}

impl OtlpHttpExporter {
    pub fn new(
        endpoint: &str,
        headers: Vec<(String, String)>,
        service_name: impl Into<String>,
    ) -> Result<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(anyhow!("OTLP endpoint must not be empty"));
        }
        let client = HttpClient::builder()
            .timeout(Duration::from_millis(EXPORT_TIMEOUT_MS))
            .build()?;
        Ok(Self {
            traces_url: format!("{}/{}", endpoint.trim_end_matches('/'), OTLP_TRACES_PATH),
            headers,
            service_name: service_name.into(),
            client,
        })
    }

    pub fn traces_url(&self) -> &str {
        &self.traces_url
    }
}

impl SpanExporter for OtlpHttpExporter {
    fn export(&self, spans: &[SpanData]) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }
        let payload = encode_export_request(&self.service_name, spans);
        let mut builder = self.client.post(&self.traces_url);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .json(&payload)
            .send()
            .map_err(|err| anyhow!("OTLP export to {} failed: {}", self.traces_url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!(
                "OTLP export to {} rejected: status={}",
                self.traces_url,
                status.as_u16()
            ));
        }
        debug!(count = spans.len(), url = %self.traces_url, "exported spans");
        Ok(())
    }
}

/// Collects exported spans in memory; useful for tests and dry runs.
#[derive(Clone, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemorySpanExporter {
    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.spans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&self, spans: &[SpanData]) -> Result<()> {
        let mut guard = self.spans.lock().unwrap_or_else(|e| e.into_inner());
        guard.extend_from_slice(spans);
        Ok(())
    }
}

/// Exports each span synchronously as soon as it ends. Export failures are
/// logged and swallowed so telemetry never blocks the benchmark.
pub struct SimpleSpanProcessor {
    exporter: Box<dyn SpanExporter>,
}

impl SimpleSpanProcessor {
    pub fn new(exporter: impl SpanExporter + 'static) -> Self {
        Self {
            exporter: Box::new(exporter),
        }
    }
}

impl SpanProcessor for SimpleSpanProcessor {
    fn on_end(&self, span: &SpanData) {
        if let Err(err) = self.exporter.export(std::slice::from_ref(span)) {
            warn!(span = %span.name, trace_id = %span.trace_id, error = %err, "span export failed");
        }
    }
}
