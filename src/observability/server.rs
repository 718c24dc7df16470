use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;
use tracing::{error, info};

use super::MetricsCollector;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Background HTTP endpoint serving the collector while a run is in progress.
///
/// `/metrics` returns the Prometheus text format, `/metrics.json` the raw
/// snapshot. The server lives on its own thread with a current-thread tokio
/// runtime and shuts down gracefully on [`MetricsServer::stop`] or drop.
pub struct MetricsServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl MetricsServer {
    pub fn start(listen: SocketAddr, collector: MetricsCollector) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<SocketAddr, String>>();

        let thread = std::thread::Builder::new()
            .name("metrics-server".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(format!("failed to build metrics runtime: {err}")));
                        return;
                    }
                };
                runtime.block_on(serve(listen, collector, ready_tx, shutdown_rx));
            })
            .context("failed to spawn metrics server thread")?;

        let address = ready_rx
            .recv()
            .map_err(|_| anyhow!("metrics server thread exited before binding"))?
            .map_err(|err| anyhow!(err))
            .with_context(|| format!("failed to start metrics server on {listen}"))?;
        info!(%address, "metrics endpoint listening");

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    listen: SocketAddr,
    collector: MetricsCollector,
    ready_tx: mpsc::Sender<Result<SocketAddr, String>>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let builder = match hyper::Server::try_bind(&listen) {
        Ok(builder) => builder,
        Err(err) => {
            let _ = ready_tx.send(Err(err.to_string()));
            return;
        }
    };
    let _ = ready_tx.send(Ok(builder.local_addr()));

    let make_svc = make_service_fn(move |_| {
        let collector = collector.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let collector = collector.clone();
                async move { Ok::<_, hyper::Error>(handle_request(&req, &collector)) }
            }))
        }
    });
    let server = builder.serve(make_svc).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    if let Err(err) = server.await {
        error!(error = %err, "metrics server error");
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn handle_request(req: &Request<Body>, collector: &MetricsCollector) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            PROMETHEUS_CONTENT_TYPE,
            collector.snapshot().to_prometheus(),
        ),
        (&Method::GET, "/metrics.json") => match serde_json::to_vec(&collector.snapshot()) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(err) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("failed to encode metrics: {err}"),
            ),
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}
