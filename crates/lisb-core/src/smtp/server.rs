//! SMTP server implementation

use crate::filtering::FilteringManager;
use crate::queue::ForwardQueue;
use crate::smtp::handler::SHUTDOWN_REPLY;
use crate::smtp::SmtpHandler;
use anyhow::{Context, Result};
use lisb_common::config::ServerConfig;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// SMTP Server
pub struct SmtpServer {
    config: ServerConfig,
    filtering: Arc<FilteringManager>,
    queue: ForwardQueue,
    shutdown: CancellationToken,
    connection_semaphore: Arc<Semaphore>,
}

impl SmtpServer {
    /// Create a new SMTP server
    pub fn new(
        config: ServerConfig,
        filtering: Arc<FilteringManager>,
        queue: ForwardQueue,
        shutdown: CancellationToken,
    ) -> Self {
        let max_connections = config.max_connections;
        Self {
            config,
            filtering,
            queue,
            shutdown,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.local_ip, self.config.local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    ///
    /// Returns once shutdown is requested and every open session has ended.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("SMTP server listening on {}", listener.local_addr()?);
        info!("Waiting for mails to filter...");

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = result {
                        error!("SMTP session task failed: {}", e);
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        // Acquire semaphore permit
                        let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!("Max connections reached, rejecting {}", peer_addr);
                                sessions.spawn(refuse(stream));
                                continue;
                            }
                        };

                        let handler = SmtpHandler::new(
                            self.config.clone(),
                            self.filtering.clone(),
                            self.queue.clone(),
                            self.shutdown.clone(),
                            peer_addr,
                        );

                        sessions.spawn(async move {
                            if let Err(e) = handler.handle(stream).await {
                                error!("SMTP session error from {}: {}", peer_addr, e);
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        info!("SMTP server stopped accepting, waiting for {} sessions", sessions.len());
        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                error!("SMTP session task failed: {}", e);
            }
        }

        Ok(())
    }
}

/// Turn away a connection over the session limit
async fn refuse(mut stream: TcpStream) {
    let reply = format!("421 {}\r\n", SHUTDOWN_REPLY);
    if let Err(e) = stream.write_all(reply.as_bytes()).await {
        warn!("Failed to refuse connection: {}", e);
    }
}
