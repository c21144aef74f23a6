use crate::catalog::{Catalog, WireCatalog};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::{self, Session, SessionSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub async fn run(cfg: Config) -> Result<()> {
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!(
        listen_addr = %cfg.listen_addr,
        upstreams = ?cfg.upstream_addrs,
        "indexguard listening"
    );

    // Initial catalog dial; failure exits non-zero
    let catalog = Arc::new(WireCatalog::from_config(&cfg));
    catalog.connect().await?;

    serve(listener, catalog, cfg.upstream_addrs.clone(), settings_from(&cfg)).await
}

fn settings_from(cfg: &Config) -> SessionSettings {
    SessionSettings {
        message_timeout: cfg.message_timeout(),
        client_idle_timeout: cfg.client_idle_timeout(),
    }
}

/// Accept loop: one spawned task per client connection.
pub async fn serve(
    listener: TcpListener,
    catalog: Arc<dyn Catalog>,
    upstream_addrs: Vec<String>,
    settings: SessionSettings,
) -> Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        tracing::debug!(%addr, "accepted connection");
        let catalog = Arc::clone(&catalog);
        let addrs = upstream_addrs.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            match handle_connection(socket, addrs, catalog, settings).await {
                Ok(()) => tracing::debug!(%addr, "session ended"),
                Err(Error::ClientIdle) => tracing::info!(%addr, "client idle timeout"),
                Err(e) => {
                    tracing::warn!(%addr, error = %format!("{e:?}"), "session closed with error")
                }
            }
        });
    }
}

async fn handle_connection(
    client: TcpStream,
    upstream_addrs: Vec<String>,
    catalog: Arc<dyn Catalog>,
    settings: SessionSettings,
) -> Result<()> {
    if let Err(e) = session::enable_keepalive(&client) {
        tracing::debug!(error = %e, "could not enable keepalive");
    }
    // Dial failure drops the client socket on return
    let upstream = session::dial_upstream(&upstream_addrs).await?;
    Session::new(client, upstream, catalog, settings).run().await
}

/// Bind, spawn the accept loop, and hand back the bound address plus a
/// shutdown sender. Used by integration tests.
pub async fn spawn_with_shutdown(
    cfg: &Config,
    catalog: Arc<dyn Catalog>,
) -> Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    let addr = listener.local_addr()?;
    let settings = settings_from(cfg);
    let upstream_addrs = cfg.upstream_addrs.clone();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_rx => {}
            res = serve(listener, catalog, upstream_addrs, settings) => {
                if let Err(e) = res {
                    tracing::error!(error = %format!("{e:?}"), "server terminated with error");
                }
            }
        }
    });

    Ok((addr, shutdown_tx, handle))
}
