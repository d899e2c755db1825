// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! InfluxDB v2 sink writing line protocol over HTTP.

use crate::error::SinkError;
use crate::normalizer::CLUSTER_NAME;
use crate::probe::Category;
use crate::sink::Sink;
use crate::table::{Row, UsageTable, Value, ENTITY, NODE, TIMESTAMP};
use async_trait::async_trait;
use reqwest::{header, Client};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct InfluxDbConfig {
    /// Base url, e.g. `http://influxdb:8086`
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    /// Measurement for function usage rows
    pub functions_measurement: String,
    /// Measurement for system usage rows
    pub infra_measurement: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InfluxDbSink {
    client: Client,
    config: InfluxDbConfig,
}

impl InfluxDbSink {
    pub fn new(config: InfluxDbConfig) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkError::Write(format!("failed to build http client: {e}")))?;
        Ok(InfluxDbSink { client, config })
    }

    fn measurement(&self, category: Category) -> &str {
        match category {
            Category::FunctionUsage => &self.config.functions_measurement,
            Category::SystemUsage => &self.config.infra_measurement,
        }
    }
}

#[async_trait]
impl Sink for InfluxDbSink {
    async fn write(&self, category: Category, table: &UsageTable) -> Result<(), SinkError> {
        let body = to_line_protocol(self.measurement(category), category, table);
        if body.is_empty() {
            debug!(category = %category, "Nothing to write");
            return Ok(());
        }
        let lines = body.lines().count();

        let url = format!("{}/api/v2/write", self.config.url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header(header::AUTHORIZATION, format!("Token {}", self.config.token))
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(category = %category, lines, "Wrote points to InfluxDB");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        error!("{}: Failed to write to InfluxDB: {:?}", status, body);
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Renders one line per row. Rows without a timestamp or without any field are skipped.
pub fn to_line_protocol(measurement: &str, category: Category, table: &UsageTable) -> String {
    let tag_columns: &[&str] = match category {
        Category::FunctionUsage => &[CLUSTER_NAME, ENTITY, NODE],
        Category::SystemUsage => &[CLUSTER_NAME, NODE],
    };

    let mut out = String::new();
    for row in table.rows() {
        if let Some(line) = render_row(measurement, tag_columns, row) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

fn render_row(measurement: &str, tag_columns: &[&str], row: &Row) -> Option<String> {
    let millis = match row.get(TIMESTAMP)? {
        Value::Time(t) => t.timestamp_millis(),
        Value::Int(secs) => secs.checked_mul(1000)?,
        _ => return None,
    };

    let mut line = escape(measurement, &[',', ' ']);
    for column in tag_columns {
        if let Some(value) = row.text(column) {
            if value.is_empty() {
                continue;
            }
            let _ = write!(
                line,
                ",{}={}",
                escape(column, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }
    }

    let mut fields = Vec::new();
    for (column, value) in row.values() {
        if column == TIMESTAMP || tag_columns.contains(&column) {
            continue;
        }
        let rendered = match value {
            Value::Float(f) if f.is_finite() => format!("{f}"),
            Value::Float(_) => continue,
            Value::Int(i) => format!("{i}i"),
            Value::Text(s) => format!("\"{}\"", escape(s, &['"', '\\'])),
            Value::Time(t) => format!("\"{}\"", t.to_rfc3339()),
        };
        fields.push(format!("{}={}", escape(column, &[',', '=', ' ']), rendered));
    }
    if fields.is_empty() {
        return None;
    }

    let _ = write!(line, " {} {}", fields.join(","), millis);
    Some(line)
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
