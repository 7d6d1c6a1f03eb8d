//! Prometheus instant-query metric source
//!
//! Each configured query yields at most one sample per pull. A failing query
//! only skips its own metric; the pull fails when every query failed.

use crate::collectors::source::{MetricSource, SourceFuture};
use crate::config::{MetricQuery, SourceConfig};
use crate::error::SourceError;
use crate::events::Sample;
use chrono::{TimeZone, Utc};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    /// `[unix_seconds, "value"]`
    value: (f64, String),
}

pub struct PrometheusSource {
    client: Client,
    base_url: String,
    queries: Vec<MetricQuery>,
}

impl PrometheusSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.query_timeout_seconds))
            .build()
            .map_err(|e| SourceError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.prometheus_url.trim_end_matches('/').to_string(),
            queries: config.queries.clone(),
        })
    }

    async fn query(&self, query: &MetricQuery) -> Result<Option<Sample>, SourceError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("query", query.query.as_str())])
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", url, e)))?;
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "{} returned {}: {}",
                url, status, body
            )));
        }

        parse_instant_query(query, &body)
    }
}

/// Turn an instant-query body into a sample from its first series
///
/// An empty result vector is not an error; the metric is simply absent.
pub fn parse_instant_query(query: &MetricQuery, body: &str) -> Result<Option<Sample>, SourceError> {
    let response: QueryResponse =
        serde_json::from_str(body).map_err(|e| SourceError::ParseError(e.to_string()))?;

    if response.status != "success" {
        return Err(SourceError::Unavailable(format!(
            "query for {} failed: {}",
            query.metric_name,
            response.error.unwrap_or_else(|| response.status.clone())
        )));
    }

    let Some(series) = response.data.and_then(|data| data.result.into_iter().next()) else {
        return Ok(None);
    };

    let (seconds, raw) = series.value;
    let value: f64 = raw.trim().parse().map_err(|_| {
        SourceError::ParseError(format!("{} value '{}' is not a number", query.metric_name, raw))
    })?;
    let timestamp = Utc
        .timestamp_millis_opt((seconds * 1000.0) as i64)
        .single()
        .unwrap_or_else(Utc::now);

    let mut sample = Sample::at(&query.metric_name, value, &query.unit, timestamp);
    sample.source_labels = series.metric;
    Ok(Some(sample))
}

impl MetricSource for PrometheusSource {
    fn pull(&self) -> SourceFuture<'_> {
        Box::pin(async move {
            let mut samples = Vec::with_capacity(self.queries.len());
            let mut last_error = None;

            for query in &self.queries {
                match self.query(query).await {
                    Ok(Some(sample)) => samples.push(sample),
                    Ok(None) => debug!("No data for {}", query.metric_name),
                    Err(e) => {
                        warn!("Skipping {}: {}", query.metric_name, e);
                        last_error = Some(e);
                    }
                }
            }

            match last_error {
                Some(e) if samples.is_empty() => Err(SourceError::Unavailable(format!(
                    "every query failed, last error: {}",
                    e
                ))),
                _ => Ok(samples),
            }
        })
    }

    fn name(&self) -> &str {
        "prometheus"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_query() -> MetricQuery {
        MetricQuery::new("cpu_usage", "cpu", "%")
    }

    #[test]
    fn test_parse_vector_result() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"instance": "web-1:9100"}, "value": [1700000000.5, "85.25"]}
                ]
            }
        }"#;

        let sample = parse_instant_query(&cpu_query(), body).unwrap().unwrap();
        assert_eq!(sample.metric_name, "cpu_usage");
        assert_eq!(sample.value, 85.25);
        assert_eq!(sample.unit, "%");
        assert_eq!(sample.timestamp.timestamp_millis(), 1_700_000_000_500);
        assert_eq!(sample.source_labels["instance"], "web-1:9100");
    }

    #[test]
    fn test_parse_empty_result() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert_eq!(parse_instant_query(&cpu_query(), body).unwrap(), None);
    }

    #[test]
    fn test_parse_error_status() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error at char 3"}"#;
        let err = parse_instant_query(&cpu_query(), body).unwrap_err();
        assert!(err.to_string().contains("parse error at char 3"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_instant_query(&cpu_query(), "<html>"),
            Err(SourceError::ParseError(_))
        ));

        let body = r#"{"status":"success","data":{"result":[{"metric":{},"value":[1.0,"high"]}]}}"#;
        assert!(matches!(
            parse_instant_query(&cpu_query(), body),
            Err(SourceError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let config = SourceConfig {
            prometheus_url: "http://127.0.0.1:9".to_string(),
            query_timeout_seconds: 1,
            ..SourceConfig::default()
        };
        let source = PrometheusSource::new(&config).unwrap();

        assert!(matches!(
            source.pull().await,
            Err(SourceError::Unavailable(_))
        ));
    }
}
