//! Plain and TLS listeners behind a common close handle.
//!
//! Both listeners serve the same merged [`Router`]. Closing a listener stops
//! accepting new connections and waits for in-flight ones to drain.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::Service;
use tracing::{debug, info, warn};

/// A bound listener that can be closed exactly once.
#[async_trait]
pub trait ListenerHandle: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting, drain in-flight connections, and report any serve error.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Plain HTTP listener driven by `axum::serve`.
pub struct PlainListener {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl PlainListener {
    /// Bind `addr` and start serving `router`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });
        info!(addr = %addr, "HTTP listener bound");
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }
}

#[async_trait]
impl ListenerHandle for PlainListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .context("HTTP listener task panicked")?
            .context("HTTP listener failed")?;
        info!(addr = %self.addr, "HTTP listener closed");
        Ok(())
    }
}

/// HTTPS listener: rustls handshake, then HTTP/1.1 or HTTP/2 via hyper.
pub struct TlsListener {
    addr: SocketAddr,
    shutdown: CancellationToken,
    connections: TaskTracker,
    task: JoinHandle<()>,
}

impl TlsListener {
    /// Bind `addr` and start serving `router` over TLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, router: Router, config: Arc<ServerConfig>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTPS listener on {addr}"))?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let connections = TaskTracker::new();
        let task = tokio::spawn(accept_loop(
            listener,
            TlsAcceptor::from(config),
            router,
            shutdown.clone(),
            connections.clone(),
        ));
        info!(addr = %addr, "HTTPS listener bound");
        Ok(Self {
            addr,
            shutdown,
            connections,
            task,
        })
    }
}

#[async_trait]
impl ListenerHandle for TlsListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.context("HTTPS accept loop panicked")?;
        self.connections.close();
        self.connections.wait().await;
        info!(addr = %self.addr, "HTTPS listener closed");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
    connections: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "HTTPS accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                router.clone().call(request)
            });
            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            tokio::pin!(conn);

            let mut draining = false;
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            debug!(peer = %peer, error = %e, "HTTPS connection ended with error");
                        }
                        break;
                    }
                    _ = shutdown.cancelled(), if !draining => {
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        });
    }
    debug!("HTTPS accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tls::{build_server_config, fixtures::self_signed};
    use axum::routing::get;

    fn app() -> Router {
        Router::new().route("/ping", get(|| async { "pong" }))
    }

    fn any_port() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn plain_listener_serves_until_closed() {
        let listener = PlainListener::bind(any_port(), app()).await.unwrap();
        let addr = listener.local_addr();

        let body = reqwest::get(format!("http://{addr}/ping"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");

        Box::new(listener).close().await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn second_bind_on_same_port_fails() {
        let first = PlainListener::bind(any_port(), app()).await.unwrap();
        let taken = first.local_addr();
        assert!(PlainListener::bind(taken, app()).await.is_err());
        Box::new(first).close().await.unwrap();
    }

    #[tokio::test]
    async fn tls_listener_serves_https_until_closed() {
        let (key, cert) = self_signed();
        let (_, chain) = self_signed();
        let config =
            build_server_config(key.as_bytes(), cert.as_bytes(), chain.as_bytes()).unwrap();
        let listener = TlsListener::bind(any_port(), app(), config).await.unwrap();
        let port = listener.local_addr().port();

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .resolve("localhost", SocketAddr::from(([127, 0, 0, 1], port)))
            .build()
            .unwrap();
        let body = client
            .get(format!("https://localhost:{port}/ping"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");

        Box::new(listener).close().await.unwrap();
    }
}
