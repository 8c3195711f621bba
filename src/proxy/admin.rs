use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use url::Url;

use crate::error::Error;
use crate::types::Result;

/// One reading of the proxy's counters, summed over all clusters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    pub request_count: u64,
    pub error_count: u64,
    pub active_connections: u64,
    pub circuit_breaker_open: bool,
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
}

impl StatsSample {
    /// Parse the output of `/stats?format=json`.
    ///
    /// Counters are summed across `cluster.<name>.*` entries; latency
    /// quantiles take the worst cluster.
    pub fn from_json(body: &Value) -> Result<Self> {
        let entries = body
            .get("stats")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::HttpClient("stats response has no \"stats\" array".into()))?;

        let mut sample = StatsSample::default();

        for entry in entries {
            if let (Some(name), Some(value)) = (
                entry.get("name").and_then(Value::as_str),
                entry.get("value").and_then(Value::as_u64),
            ) {
                if !name.starts_with("cluster.") {
                    continue;
                }
                if name.ends_with(".upstream_rq_total") {
                    sample.request_count += value;
                } else if name.ends_with(".upstream_rq_5xx") || name.ends_with(".upstream_rq_reset") {
                    sample.error_count += value;
                } else if name.ends_with(".upstream_cx_active") {
                    sample.active_connections += value;
                } else if name.contains(".circuit_breakers.") && name.ends_with("_open") && value > 0 {
                    sample.circuit_breaker_open = true;
                }
            } else if let Some(histograms) = entry.get("histograms") {
                sample.read_latency(histograms);
            }
        }

        Ok(sample)
    }

    fn read_latency(&mut self, histograms: &Value) {
        let supported: Vec<f64> = histograms
            .get("supported_quantiles")
            .and_then(Value::as_array)
            .map(|q| q.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        let position = |q: f64| supported.iter().position(|s| (*s - q).abs() < f64::EPSILON);
        let (p50, p95, p99) = (position(50.0), position(95.0), position(99.0));

        let computed = match histograms.get("computed_quantiles").and_then(Value::as_array) {
            Some(computed) => computed,
            None => return,
        };

        for histogram in computed {
            let is_rq_time = histogram
                .get("name")
                .and_then(Value::as_str)
                .map(|n| n.starts_with("cluster.") && n.ends_with(".upstream_rq_time"))
                .unwrap_or(false);
            if !is_rq_time {
                continue;
            }
            let values = match histogram.get("values").and_then(Value::as_array) {
                Some(values) => values,
                None => continue,
            };
            let at = |i: Option<usize>| {
                i.and_then(|i| values.get(i))
                    .and_then(|v| v.get("cumulative"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0)
            };
            self.latency_p50 = self.latency_p50.max(at(p50));
            self.latency_p95 = self.latency_p95.max(at(p95));
            self.latency_p99 = self.latency_p99.max(at(p99));
        }
    }
}

/// Access to a running proxy's admin interface
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    /// Current counters
    async fn stats(&self) -> Result<StatsSample>;

    /// Live configuration as reported by the proxy
    async fn config_dump(&self) -> Result<Value>;
}

/// Admin client speaking HTTP to `127.0.0.1:<admin_port>`
pub struct HttpProxyAdmin {
    client: reqwest::Client,
    base: Url,
}

impl HttpProxyAdmin {
    pub fn new(admin_port: u16, timeout: Duration) -> Result<Self> {
        let base = Url::parse(&format!("http://127.0.0.1:{}/", admin_port))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    async fn get_json(&self, url: Url) -> Result<Value> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::HttpClient(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ProxyAdmin for HttpProxyAdmin {
    async fn stats(&self) -> Result<StatsSample> {
        let mut url = self.base.join("stats")?;
        url.query_pairs_mut().append_pair("format", "json");
        let body = self.get_json(url).await?;
        StatsSample::from_json(&body)
    }

    async fn config_dump(&self) -> Result<Value> {
        let url = self.base.join("config_dump")?;
        self.get_json(url).await
    }
}
