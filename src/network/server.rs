//! Inbound HTTP server emulating the upstream surface

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::recording::Finalizer;
use crate::replay::DecisionEngine;
use crate::Result;

use super::connection_pool::ConnectionPool;
use super::router::route;
use super::SHUTDOWN_TIMEOUT_MS;

/// Serves the decision engine over HTTP/1 and optionally drives the
/// capture trigger
pub struct Server {
    listen_port: u16,
    engine: Arc<DecisionEngine>,
    trigger: Option<(Arc<Finalizer>, Duration)>,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a server for `engine`
    #[must_use]
    pub fn new(config: &Config, engine: Arc<DecisionEngine>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            listen_port: config.listen_port,
            engine,
            trigger: None,
            connection_pool: ConnectionPool::new(config.limits.max_connections),
            shutdown_tx,
        }
    }

    /// Run `finalizer`'s trigger every `interval` while serving
    #[must_use]
    pub fn with_trigger(mut self, finalizer: Arc<Finalizer>, interval: Duration) -> Self {
        self.trigger = Some((finalizer, interval));
        self
    }

    /// Sender that stops the server when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured port and serve until Ctrl-C or shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until Ctrl-C or shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut background = JoinSet::new();

        if let Some((finalizer, interval)) = &self.trigger {
            info!("Capture trigger every {:?}", interval);
            background.spawn(
                Arc::clone(finalizer).run_periodically(*interval, self.shutdown_tx.subscribe()),
            );
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let Some(guard) = self.connection_pool.try_acquire() else {
                                warn!("Connection limit reached, rejecting {}", peer_addr);
                                drop(stream);
                                continue;
                            };

                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                let _guard = guard;
                                let service = service_fn(move |request: Request<Incoming>| {
                                    let engine = Arc::clone(&engine);
                                    async move {
                                        let reply =
                                            route(&engine, request.method(), request.uri()).await;
                                        Ok::<_, Infallible>(reply.into_response())
                                    }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!("Connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        drop(listener);
        self.shutdown_tx.send(()).ok();

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        let pool = self.connection_pool.clone();
        if tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = background.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
            while pool.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_err()
        {
            warn!(
                "Shutdown timed out, dropping {} open connections",
                pool.active_connections()
            );
        }

        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::network::mock::ScriptedUpstream;
    use crate::network::{HyperUpstream, Upstream, UpstreamRequest};
    use crate::storage::{fixtures, MemoryBlobStore, ReplayId, ReplayStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> Config {
        toml::from_str(
            r#"
            data_dir = "/tmp"
            [upstream]
            host = "127.0.0.1"
            [limits]
            max_connections = 10
            "#,
        )
        .unwrap()
    }

    async fn engine() -> Arc<DecisionEngine> {
        let store = ReplayStore::new(Arc::new(MemoryBlobStore::new()));
        store
            .write_record(
                &ReplayId::parse("abc").unwrap(),
                &fixtures::record("abc", 1, false),
            )
            .await
            .unwrap();
        Arc::new(DecisionEngine::from_config(
            &test_config(),
            store,
            Arc::new(ScriptedUpstream::new()) as Arc<dyn Upstream>,
        ))
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(&test_config(), engine().await);
        assert_eq!(server.connection_pool.max_connections(), 10);
    }

    async fn get_and_close(port: u16, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_finished_connections_release_their_slots() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = Server::new(&test_config(), engine().await);
        let pool = server.connection_pool.clone();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(server.serve(listener));

        // More connections than the limit, one after another
        for _ in 0..25 {
            let response = get_and_close(port, "/meta/abc").await;
            assert!(response.starts_with("HTTP/1.1 200"));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.send(()).ok();
        let result = tokio::time::timeout(Duration::from_secs(10), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serves_over_http_and_shuts_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = Server::new(&test_config(), engine().await);
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(server.serve(listener));

        // The server speaks the upstream protocol, so the upstream client can talk to it
        let client = HyperUpstream::new(&UpstreamConfig {
            timeout_ms: 2_000,
            ..UpstreamConfig::http("127.0.0.1", port)
        })
        .unwrap();

        let response = client.send(UpstreamRequest::get("/meta/abc")).await.unwrap();
        assert_eq!(response.status, hyper::StatusCode::OK);
        let meta: serde_json::Value = response.json().await.unwrap();
        assert_eq!(meta["numChunks"], 3);

        shutdown.send(()).ok();
        let result = tokio::time::timeout(Duration::from_secs(10), handle).await;
        assert!(result.is_ok());
    }
}
