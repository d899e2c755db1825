// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod control;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use serverless_usage_core::{
    config::MonitorConfig,
    cycle::Collector,
    error::ConfigError,
    influxdb::InfluxDbSink,
    platforms::{
        openfaas::{self, OpenFaasOptions},
        openwhisk, Platform,
    },
    prometheus::PrometheusClient,
    registry::ProbeRegistry,
    scheduler::PeriodicScheduler,
};

#[tokio::main]
pub async fn main() {
    let config = match MonitorConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            // logging is not set up yet
            eprintln!("Error loading usage monitor configuration: {e}");
            return;
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let registry = match build_registry(&config) {
        Ok(registry) => registry,
        Err(e) => {
            error!("Error building probe registry for {}: {e}", config.platform);
            return;
        }
    };

    let sink = match InfluxDbSink::new(config.influxdb()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!("Error creating InfluxDB sink: {e}");
            return;
        }
    };

    let collector = match Collector::new(config.cluster_name.clone(), registry, sink) {
        Ok(collector) => collector,
        Err(e) => {
            error!("Error creating collector: {e}");
            return;
        }
    };

    info!(
        platform = %config.platform,
        cluster = %config.cluster_name,
        period = ?config.period,
        "Starting serverless usage monitor"
    );

    let scheduler = PeriodicScheduler::new(config.period, Arc::new(collector));
    if config.autostart {
        scheduler.start().await;
    } else {
        info!("Autostart disabled, waiting for GET /start");
    }

    let shutdown = CancellationToken::new();
    let control = tokio::spawn(control::serve(
        config.control_port,
        scheduler.clone(),
        shutdown.clone(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }
    info!("Shutting down serverless usage monitor");

    shutdown.cancel();
    scheduler.stop().await;
    match control.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Control server failed: {e}"),
        Err(e) => error!("Control server task died: {e:?}"),
    }
}

/// Cloud platforms need provider SDK clients this binary does not ship.
fn build_registry(config: &MonitorConfig) -> Result<ProbeRegistry, ConfigError> {
    let prometheus = |url: String| -> Result<Arc<PrometheusClient>, ConfigError> {
        PrometheusClient::new(url.as_str(), config.http_timeout)
            .map(Arc::new)
            .map_err(|e| ConfigError::InvalidConfig(format!("Prometheus client for {url}: {e}")))
    };

    match config.platform {
        Platform::OpenWhisk => Ok(openwhisk::registry(
            prometheus(config.platform_prometheus_url())?,
            prometheus(config.kubernetes_prometheus_url())?,
        )),
        Platform::OpenFaas => Ok(openfaas::registry(
            prometheus(config.platform_prometheus_url())?,
            prometheus(config.kubernetes_prometheus_url())?,
            OpenFaasOptions {
                power_collection: config.power_collection,
            },
        )),
        Platform::Gcf | Platform::Aws => Err(ConfigError::UnsupportedPlatform(
            config.platform.to_string(),
        )),
    }
}
