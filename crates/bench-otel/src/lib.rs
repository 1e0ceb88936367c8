use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bench_core::optional_env;
use tracing::{info, warn};

mod collector;
mod exporter;
mod tracer;

pub use collector::{LocalCollector, TraceIngestRecord};
pub use exporter::{
    encode_export_request, InMemorySpanExporter, OtlpHttpExporter, SimpleSpanProcessor,
    SpanExporter,
};
pub use tracer::{
    now_unix_nano, ActiveSpan, AttributeValue, SpanData, SpanProcessor, SpanStatus, Tracer,
    TracerProvider,
};

pub const LANGFUSE_PUBLIC_KEY_ENV: &str = "LANGFUSE_PUBLIC_KEY";
pub const LANGFUSE_SECRET_KEY_ENV: &str = "LANGFUSE_SECRET_KEY";
pub const LANGFUSE_HOST_ENV: &str = "LANGFUSE_HOST";
pub const LANGFUSE_OTEL_PATH: &str = "/api/public/otel";
pub const DEFAULT_SERVICE_NAME: &str = "dabstep-bench";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LangfuseConfig {
    pub public_key: String,
    pub secret_key: String,
    pub host: String,
}

impl LangfuseConfig {
    /// Reads the collector credentials from the environment. Values are not
    /// validated; a bad key or host surfaces as export failures later.
    pub fn from_env() -> Option<Self> {
        let public_key = optional_env(LANGFUSE_PUBLIC_KEY_ENV);
        let secret_key = optional_env(LANGFUSE_SECRET_KEY_ENV);
        let host = optional_env(LANGFUSE_HOST_ENV);
        if public_key.is_none() && secret_key.is_none() && host.is_none() {
            return None;
        }
        if public_key.is_none() || secret_key.is_none() || host.is_none() {
            warn!("Langfuse configuration is incomplete; span export will likely fail");
        }
        Some(Self {
            public_key: public_key.unwrap_or_default(),
            secret_key: secret_key.unwrap_or_default(),
            host: host.unwrap_or_default(),
        })
    }

    pub fn otlp_endpoint(&self) -> String {
        format!("{}{}", self.host.trim_end_matches('/'), LANGFUSE_OTEL_PATH)
    }

    pub fn auth_header(&self) -> String {
        basic_auth_header(&self.public_key, &self.secret_key)
    }
}

pub fn basic_auth_header(public_key: &str, secret_key: &str) -> String {
    let token = BASE64_STANDARD.encode(format!("{}:{}", public_key, secret_key));
    format!("Basic {}", token)
}

/// Builds a provider whose spans are exported one by one to `endpoint`.
pub fn setup_otlp(
    endpoint: &str,
    headers: Vec<(String, String)>,
    service_name: &str,
) -> Result<TracerProvider> {
    let exporter = OtlpHttpExporter::new(endpoint, headers, service_name)?;
    let provider = TracerProvider::new();
    provider.add_span_processor(SimpleSpanProcessor::new(exporter));
    Ok(provider)
}

pub fn setup_langfuse(config: &LangfuseConfig, service_name: &str) -> Result<TracerProvider> {
    let endpoint = config.otlp_endpoint();
    let provider = setup_otlp(
        &endpoint,
        vec![("Authorization".to_string(), config.auth_header())],
        service_name,
    )?;
    info!(endpoint = %endpoint, "trace export configured");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_header_encodes_key_pair() {
        assert_eq!(
            basic_auth_header("pk-lf-123", "sk-lf-456"),
            "Basic cGstbGYtMTIzOnNrLWxmLTQ1Ng=="
        );
    }

    #[test]
    fn otlp_endpoint_uses_public_otel_path() {
        let config = LangfuseConfig {
            public_key: "pk".to_string(),
            secret_key: "sk".to_string(),
            host: "https://cloud.langfuse.com/".to_string(),
        };
        assert_eq!(
            config.otlp_endpoint(),
            "https://cloud.langfuse.com/api/public/otel"
        );
        assert_eq!(config.auth_header(), basic_auth_header("pk", "sk"));
    }
}
