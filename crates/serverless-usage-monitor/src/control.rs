// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tiny HTTP control surface: `GET /start`, `GET /stop` and `GET /status`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use serverless_usage_core::scheduler::{
    PeriodicScheduler, SchedulerStatus, StartOutcome, StopOutcome,
};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const START_PATH: &str = "/start";
const STOP_PATH: &str = "/stop";
const STATUS_PATH: &str = "/status";

pub async fn serve(
    port: u16,
    scheduler: PeriodicScheduler,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(&addr).await?;
    info!("Control server listening on {addr}");

    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = JoinSet::new();

    loop {
        let conn = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Control server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Control connection handler panicked: {e:?}");
                    continue;
                }
                Ok(()) | Err(_) => continue,
            },
        };

        let conn = TokioIo::new(conn);
        let server = server.clone();
        let scheduler = scheduler.clone();
        joinset.spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let scheduler = scheduler.clone();
                async move {
                    Ok::<_, Infallible>(route(req.method(), req.uri().path(), &scheduler).await)
                }
            });
            if let Err(e) = server.serve_connection(conn, service).await {
                error!("Control connection error: {e}");
            }
        });
    }

    debug!("Control server shutting down");
    joinset.abort_all();
    Ok(())
}

pub async fn route(
    method: &Method,
    path: &str,
    scheduler: &PeriodicScheduler,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, START_PATH) => match scheduler.start().await {
            StartOutcome::Started => respond("Collection started", StatusCode::OK),
            StartOutcome::AlreadyRunning => respond("Collection already running", StatusCode::OK),
        },
        (&Method::GET, STOP_PATH) => match scheduler.stop().await {
            StopOutcome::Stopped => respond("Collection stopped", StatusCode::OK),
            StopOutcome::NotRunning => respond("Collection not running", StatusCode::OK),
        },
        (&Method::GET, STATUS_PATH) => match scheduler.status().await {
            SchedulerStatus::Running => respond("running", StatusCode::OK),
            SchedulerStatus::Idle => respond("idle", StatusCode::OK),
        },
        _ => respond(&format!("No route for {method} {path}"), StatusCode::NOT_FOUND),
    }
}

fn respond(message: &str, status: StatusCode) -> Response<Full<Bytes>> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use serverless_usage_core::scheduler::CycleJob;
    use std::sync::Arc;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl CycleJob for Noop {
        async fn run(&self, _cancel: CancellationToken) {}
    }

    async fn message(response: Response<Full<Bytes>>) -> String {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        value["message"].as_str().unwrap().to_string()
    }

    fn scheduler() -> PeriodicScheduler {
        PeriodicScheduler::new(Duration::from_secs(60), Arc::new(Noop))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_status() {
        let scheduler = scheduler();

        let response = route(&Method::GET, STATUS_PATH, &scheduler).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(message(response).await, "idle");

        let response = route(&Method::GET, START_PATH, &scheduler).await;
        assert_eq!(message(response).await, "Collection started");
        let response = route(&Method::GET, START_PATH, &scheduler).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(message(response).await, "Collection already running");
        assert_eq!(
            message(route(&Method::GET, STATUS_PATH, &scheduler).await).await,
            "running"
        );

        let response = route(&Method::GET, STOP_PATH, &scheduler).await;
        assert_eq!(message(response).await, "Collection stopped");
        let response = route(&Method::GET, STOP_PATH, &scheduler).await;
        assert_eq!(message(response).await, "Collection not running");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let scheduler = scheduler();
        let response = route(&Method::POST, START_PATH, &scheduler).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = route(&Method::GET, "/metrics", &scheduler).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(message(response).await, "No route for GET /metrics");
        assert!(!scheduler.is_running().await);
    }
}
