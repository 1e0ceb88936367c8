use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&String> for AttributeValue {
    fn from(value: &String) -> Self {
        Self::String(value.clone())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    pub fn otlp_code(self) -> u8 {
        match self {
            Self::Unset => 0,
            Self::Ok => 1,
            Self::Error => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanData {
    pub scope: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_unix_nano: u64,
    pub end_unix_nano: u64,
    pub attributes: Vec<(String, AttributeValue)>,
    pub status: SpanStatus,
    pub status_message: Option<String>,
}

impl SpanData {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

/// Receives every span once it has ended.
pub trait SpanProcessor: Send + Sync {
    fn on_end(&self, span: &SpanData);
}

#[derive(Clone, Default)]
pub struct TracerProvider {
    processors: Arc<Mutex<Vec<Box<dyn SpanProcessor>>>>,
}

impl TracerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_span_processor(&self, processor: impl SpanProcessor + 'static) {
        if let Ok(mut guard) = self.processors.lock() {
            guard.push(Box::new(processor));
        }
    }

    pub fn tracer(&self, scope: impl Into<String>) -> Tracer {
        Tracer {
            scope: scope.into(),
            provider: self.clone(),
        }
    }

    fn dispatch(&self, span: &SpanData) {
        let guard = self
            .processors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for processor in guard.iter() {
            processor.on_end(span);
        }
    }
}

#[derive(Clone)]
pub struct Tracer {
    scope: String,
    provider: TracerProvider,
}

impl Tracer {
    pub fn start_span(&self, name: impl Into<String>) -> ActiveSpan {
        ActiveSpan::start(self.clone(), new_trace_id(), None, name.into())
    }
}

/// A span that is exported when `end` is called or when it is dropped.
pub struct ActiveSpan {
    tracer: Tracer,
    data: Option<SpanData>,
}

impl ActiveSpan {
    fn start(tracer: Tracer, trace_id: String, parent: Option<String>, name: String) -> Self {
        let data = SpanData {
            scope: tracer.scope.clone(),
            trace_id,
            span_id: new_span_id(),
            parent_span_id: parent,
            name,
            start_unix_nano: now_unix_nano(),
            end_unix_nano: 0,
            attributes: Vec::new(),
            status: SpanStatus::Unset,
            status_message: None,
        };
        Self {
            tracer,
            data: Some(data),
        }
    }

    pub fn trace_id(&self) -> &str {
        self.data.as_ref().map(|d| d.trace_id.as_str()).unwrap_or("")
    }

    pub fn span_id(&self) -> &str {
        self.data.as_ref().map(|d| d.span_id.as_str()).unwrap_or("")
    }

    pub fn child(&self, name: impl Into<String>) -> ActiveSpan {
        ActiveSpan::start(
            self.tracer.clone(),
            self.trace_id().to_string(),
            Some(self.span_id().to_string()),
            name.into(),
        )
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if let Some(data) = self.data.as_mut() {
            let key = key.into();
            let value = value.into();
            match data.attributes.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => data.attributes.push((key, value)),
            }
        }
    }

    pub fn set_ok(&mut self) {
        if let Some(data) = self.data.as_mut() {
            data.status = SpanStatus::Ok;
        }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        if let Some(data) = self.data.as_mut() {
            data.status = SpanStatus::Error;
            data.status_message = Some(message.into());
        }
    }

    /// Backdates the span to a start time recorded elsewhere, e.g. by the
    /// agent's own step log.
    pub fn set_start_unix_nano(&mut self, start: u64) {
        if let Some(data) = self.data.as_mut() {
            data.start_unix_nano = start;
        }
    }

    pub fn end(mut self) {
        self.finish(None);
    }

    pub fn end_at(mut self, end_unix_nano: u64) {
        self.finish(Some(end_unix_nano));
    }

    fn finish(&mut self, end_unix_nano: Option<u64>) {
        if let Some(mut data) = self.data.take() {
            data.end_unix_nano = end_unix_nano
                .unwrap_or_else(now_unix_nano)
                .max(data.start_unix_nano);
            self.tracer.provider.dispatch(&data);
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.finish(None);
    }
}

pub fn now_unix_nano() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0)
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw[..16].to_string()
}
