// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use crate::influxdb::InfluxDbConfig;
use crate::platforms::Platform;
use std::env;
use std::time::Duration;

/// Configuration for the usage monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Platform to collect from
    pub platform: Platform,
    /// Tag written on every row
    pub cluster_name: String,
    /// Host running the Prometheus instances
    pub cluster_host: String,
    /// Prometheus scraping the serverless platform itself
    pub platform_prometheus_port: u16,
    /// Prometheus scraping Kubernetes and node exporters
    pub kubernetes_prometheus_port: u16,
    /// Whether to attribute node power to functions (OpenFaaS)
    pub power_collection: bool,
    /// Time between the starts of two collection cycles
    pub period: Duration,
    pub influxdb_host: String,
    pub influxdb_port: u16,
    pub influxdb_token: String,
    pub influxdb_org: String,
    pub influxdb_bucket: String,
    /// Measurement for function usage
    pub influxdb_table_functions: String,
    /// Measurement for system usage
    pub influxdb_table_infra: String,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Port of the start/stop control server
    pub control_port: u16,
    /// Start collecting without waiting for `/start`
    pub autostart: bool,
    /// Timeout of every outgoing HTTP request
    pub http_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            platform: Platform::OpenWhisk,
            cluster_name: "default".to_string(),
            cluster_host: "localhost".to_string(),
            platform_prometheus_port: 9090,
            kubernetes_prometheus_port: 9091,
            power_collection: false,
            period: Duration::from_secs(60),
            influxdb_host: "localhost".to_string(),
            influxdb_port: 8086,
            influxdb_token: String::new(),
            influxdb_org: "default".to_string(),
            influxdb_bucket: "default".to_string(),
            influxdb_table_functions: "functions".to_string(),
            influxdb_table_infra: "infrastructure".to_string(),
            log_level: "info".to_string(),
            control_port: 3005,
            autostart: true,
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl MonitorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Create configuration from any variable source. Unparseable numbers fall back to
    /// their defaults; an unknown platform is an error.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let string = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());
        let port = |name: &str, default: u16| {
            var(name)
                .and_then(|val| val.trim().parse::<u16>().ok())
                .unwrap_or(default)
        };
        let flag = |name: &str, default: bool| {
            var(name)
                .map(|val| val.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };
        let seconds = |name: &str, default: Duration| {
            var(name)
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let platform = match var("CLUSTER_TYPE") {
            Some(val) => val.parse::<Platform>()?,
            None => defaults.platform,
        };

        let config = Self {
            platform,
            cluster_name: string("CLUSTER_NAME", &defaults.cluster_name),
            cluster_host: string("CLUSTER_HOST", &defaults.cluster_host),
            platform_prometheus_port: port(
                "CLUSTER_SERVERLESS_PLATFORM_PROMETHEUS_PORT",
                defaults.platform_prometheus_port,
            ),
            kubernetes_prometheus_port: port(
                "CLUSTER_KUBERNETES_PROMETHEUS_PORT",
                defaults.kubernetes_prometheus_port,
            ),
            power_collection: flag("POWER_COLLECTION", defaults.power_collection),
            period: seconds("DEFAULT_LOGGING_PERIOD", defaults.period),
            influxdb_host: string("INFLUXDB_HOST", &defaults.influxdb_host),
            influxdb_port: port("INFLUXDB_PORT", defaults.influxdb_port),
            influxdb_token: string("INFLUXDB_ADMIN_TOKEN", &defaults.influxdb_token),
            influxdb_org: string("INFLUXDB_ORG", &defaults.influxdb_org),
            influxdb_bucket: string("INFLUXDB_BUCKET", &defaults.influxdb_bucket),
            influxdb_table_functions: string(
                "INFLUXDB_TABLE_FUNCTIONS",
                &defaults.influxdb_table_functions,
            ),
            influxdb_table_infra: string("INFLUXDB_TABLE_INFRA", &defaults.influxdb_table_infra),
            log_level: var("LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or_else(|| defaults.log_level.clone()),
            control_port: port("CONTROL_PORT", defaults.control_port),
            autostart: flag("AUTOSTART", defaults.autostart),
            http_timeout: seconds("HTTP_TIMEOUT_SECS", defaults.http_timeout),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "DEFAULT_LOGGING_PERIOD must be greater than 0".to_string(),
            ));
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "HTTP_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "CLUSTER_NAME cannot be empty".to_string(),
            ));
        }

        if matches!(self.platform, Platform::OpenWhisk | Platform::OpenFaas) {
            if self.cluster_host.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "CLUSTER_HOST cannot be empty".to_string(),
                ));
            }
            if self.platform_prometheus_port == 0 || self.kubernetes_prometheus_port == 0 {
                return Err(ConfigError::InvalidConfig(
                    "Prometheus ports must be greater than 0".to_string(),
                ));
            }
        }

        if self.influxdb_host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "INFLUXDB_HOST cannot be empty".to_string(),
            ));
        }
        if self.influxdb_port == 0 || self.control_port == 0 {
            return Err(ConfigError::InvalidConfig(
                "INFLUXDB_PORT and CONTROL_PORT must be greater than 0".to_string(),
            ));
        }
        for (name, value) in [
            ("INFLUXDB_ORG", &self.influxdb_org),
            ("INFLUXDB_BUCKET", &self.influxdb_bucket),
            ("INFLUXDB_TABLE_FUNCTIONS", &self.influxdb_table_functions),
            ("INFLUXDB_TABLE_INFRA", &self.influxdb_table_infra),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!("{name} cannot be empty")));
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn platform_prometheus_url(&self) -> String {
        format!("http://{}:{}", self.cluster_host, self.platform_prometheus_port)
    }

    pub fn kubernetes_prometheus_url(&self) -> String {
        format!("http://{}:{}", self.cluster_host, self.kubernetes_prometheus_port)
    }

    pub fn influxdb(&self) -> InfluxDbConfig {
        InfluxDbConfig {
            url: format!("http://{}:{}", self.influxdb_host, self.influxdb_port),
            token: self.influxdb_token.clone(),
            org: self.influxdb_org.clone(),
            bucket: self.influxdb_bucket.clone(),
            functions_measurement: self.influxdb_table_functions.clone(),
            infra_measurement: self.influxdb_table_infra.clone(),
            timeout: self.http_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<MonitorConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MonitorConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_reads_every_setting() {
        let config = from_pairs(&[
            ("CLUSTER_TYPE", "OPENFAAS"),
            ("CLUSTER_NAME", "lab"),
            ("CLUSTER_HOST", "10.0.0.5"),
            ("CLUSTER_SERVERLESS_PLATFORM_PROMETHEUS_PORT", "31119"),
            ("CLUSTER_KUBERNETES_PROMETHEUS_PORT", "30090"),
            ("POWER_COLLECTION", "True"),
            ("DEFAULT_LOGGING_PERIOD", "300"),
            ("INFLUXDB_HOST", "influx"),
            ("INFLUXDB_PORT", "8087"),
            ("INFLUXDB_ADMIN_TOKEN", "tok"),
            ("INFLUXDB_ORG", "org"),
            ("INFLUXDB_BUCKET", "usage"),
            ("INFLUXDB_TABLE_FUNCTIONS", "fn"),
            ("INFLUXDB_TABLE_INFRA", "infra"),
            ("LOG_LEVEL", "DEBUG"),
            ("CONTROL_PORT", "4000"),
            ("AUTOSTART", "false"),
            ("HTTP_TIMEOUT_SECS", "3"),
        ])
        .unwrap();

        assert_eq!(config.platform, Platform::OpenFaas);
        assert_eq!(config.cluster_name, "lab");
        assert_eq!(config.platform_prometheus_url(), "http://10.0.0.5:31119");
        assert_eq!(config.kubernetes_prometheus_url(), "http://10.0.0.5:30090");
        assert!(config.power_collection);
        assert_eq!(config.period, Duration::from_secs(300));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.control_port, 4000);
        assert!(!config.autostart);

        let influx = config.influxdb();
        assert_eq!(influx.url, "http://influx:8087");
        assert_eq!(influx.token, "tok");
        assert_eq!(influx.functions_measurement, "fn");
        assert_eq!(influx.infra_measurement, "infra");
        assert_eq!(influx.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_unparseable_numbers_use_defaults() {
        let config =
            from_pairs(&[("INFLUXDB_PORT", "abc"), ("DEFAULT_LOGGING_PERIOD", "-1")]).unwrap();
        assert_eq!(config.influxdb_port, 8086);
        assert_eq!(config.period, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_platform() {
        let err = from_pairs(&[("CLUSTER_TYPE", "KNATIVE")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedPlatform(p) if p == "KNATIVE"));
    }

    #[test]
    fn test_validate_zero_period() {
        let err = from_pairs(&[("DEFAULT_LOGGING_PERIOD", "0")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: DEFAULT_LOGGING_PERIOD must be greater than 0"
        );
    }

    #[test]
    fn test_validate_empty_cluster_host_only_for_prometheus_platforms() {
        let config = MonitorConfig {
            cluster_host: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MonitorConfig {
            platform: Platform::Aws,
            cluster_host: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_bucket() {
        let config = MonitorConfig {
            influxdb_bucket: "".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = MonitorConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
