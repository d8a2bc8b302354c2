use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{registry::Registry, session::handle_connection};

/// Accepts connections and runs one session task per connection.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// registered session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    close_all_sessions(&registry).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, registry: &Arc<Registry>) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(%peer, error = ?err, "failed to disable send coalescing");
    }

    debug!(%peer, "accepted connection");
    let (reader, writer) = stream.into_split();
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let reason = handle_connection(reader, writer, peer, registry).await;
        debug!(%peer, ?reason, "connection finished");
    });
}

async fn close_all_sessions(registry: &Registry) {
    let sessions = registry.snapshot().await;
    info!(sessions = sessions.len(), "relay shutting down");

    join_all(sessions.iter().map(|session| async move {
        if let Err(err) = session.close().await {
            warn!(
                conn = session.id(),
                name = session.name(),
                error = ?err,
                "failed to close session"
            );
        }
    }))
    .await;
}
