//! Request counters exposed at `GET /metrics` in the OpenMetrics text format.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub endpoint: String,
    /// `ok` or the public error code
    pub outcome: String,
}

pub struct Metrics {
    registry: Registry,
    requests: Family<OutcomeLabels, Counter>,
    upload_bytes: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("cutechan");
        let requests = Family::<OutcomeLabels, Counter>::default();
        let upload_bytes = Counter::default();
        registry.register(
            "requests",
            "API requests by endpoint and outcome",
            requests.clone(),
        );
        registry.register(
            "upload_bytes",
            "Bytes received in accepted upload files",
            upload_bytes.clone(),
        );
        Self {
            registry,
            requests,
            upload_bytes,
        }
    }

    pub fn record(&self, endpoint: &str, outcome: &str) {
        self.requests
            .get_or_create(&OutcomeLabels {
                endpoint: endpoint.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn record_upload_bytes(&self, n: usize) {
        self.upload_bytes.inc_by(n as u64);
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
