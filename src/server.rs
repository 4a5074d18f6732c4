use crate::gate::ReadinessGate;
use crate::router::{is_upgrade_request, ProxyRouter};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Liveness endpoint answered by the wrapper itself
pub const HEALTH_PATH: &str = "/health";

/// How long the accept loop gets to wind down after the shutdown flag flips
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthStatus<'a> {
    pub status: &'static str,
    pub token: &'a str,
}

impl<'a> HealthStatus<'a> {
    pub fn new(ready: bool, token: &'a str) -> Self {
        let status = if ready { "ok" } else { "starting" };
        Self { status, token }
    }
}

/// The external listener. Every request except the health check goes
/// through the readiness gate and on to the router.
pub struct FrontendServer {
    listener: TcpListener,
    gate: Arc<ReadinessGate>,
    router: Arc<ProxyRouter>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontendServer {
    /// Bind the listening socket right away so the caller learns about
    /// address problems before anything is spawned.
    pub async fn bind(
        bind_addr: SocketAddr,
        gate: Arc<ReadinessGate>,
        router: Arc<ProxyRouter>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e)
        })?;

        Ok(Self {
            listener,
            gate,
            router,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the shutdown flag flips
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, backend = %self.router.target(), "Wrapper server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gate = Arc::clone(&self.gate);
                            let router = Arc::clone(&self.router);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gate, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Wrapper server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Serve until `signal` resolves, then shut down in order: flip the
    /// shutdown flag so the listener stops accepting, close the gate and
    /// terminate the backend, and wait for the accept loop to finish.
    ///
    /// The shutdown sequence runs even when `signal` fails; its error is
    /// returned afterwards.
    pub async fn run_until<F>(
        self,
        shutdown_tx: watch::Sender<bool>,
        signal: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let gate = Arc::clone(&self.gate);
        let router = Arc::clone(&self.router);

        let server_handle = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(error = %e, "Wrapper server error");
            }
        });

        let signalled = signal.await;
        if let Err(e) = &signalled {
            error!(error = %e, "Shutdown signal failed, shutting down");
        }

        let _ = shutdown_tx.send(true);
        gate.shutdown().await;

        if tokio::time::timeout(SERVER_STOP_TIMEOUT, server_handle).await.is_err() {
            warn!(
                timeout_secs = SERVER_STOP_TIMEOUT.as_secs(),
                "Wrapper server did not stop in time"
            );
        }

        let stats = router.pool().stats();
        info!(
            total_requests = stats.get_total_requests(),
            failed_requests = stats.get_failed_requests(),
            "Proxy totals"
        );

        signalled
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    gate: Arc<ReadinessGate>,
    router: Arc<ProxyRouter>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gate = Arc::clone(&gate);
        let router = Arc::clone(&router);
        async move { handle_request(req, gate, router, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    gate: Arc<ReadinessGate>,
    router: Arc<ProxyRouter>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.method() == Method::GET && req.uri().path() == HEALTH_PATH {
        return Ok(health_response(&gate));
    }

    let state = gate.ensure_started().await;
    debug!(
        method = %req.method(),
        uri = %req.uri(),
        state = state.as_str(),
        client = %client_addr,
        "Incoming request"
    );

    if is_upgrade_request(&req) {
        return Ok(router.forward_upgrade(req, client_addr).await);
    }

    Ok(router.forward(req, client_addr).await)
}

fn health_response(gate: &ReadinessGate) -> Response<BoxBody<Bytes, hyper::Error>> {
    let health = HealthStatus::new(gate.is_ready(), gate.token());
    let body = serde_json::to_string(&health).unwrap_or_else(|_| {
        format!(r#"{{"status":"{}","token":"{}"}}"#, health.status, health.token)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_mapping() {
        assert_eq!(HealthStatus::new(true, "t").status, "ok");
        assert_eq!(HealthStatus::new(false, "t").status, "starting");
    }

    #[test]
    fn test_health_status_json() {
        let json = serde_json::to_string(&HealthStatus::new(true, "abc")).unwrap();
        assert_eq!(json, r#"{"status":"ok","token":"abc"}"#);
    }
}
