// Accept loop: binds the listening socket and hands each connection to its own
// session task.
use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use pylon_common::ErrorOrigin;
use pylon_transport::TcpServer;
use pylon_wire::PayloadCodec;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::ToSocketAddrs;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::BrokerConfig;
use crate::registry::SessionRegistry;
use crate::session::run_session;

// Pause after a failed accept so a persistent error (fd exhaustion) cannot spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Listening side of the broker.
///
/// `stop` closes the listening socket and ends every live session. Dropping the
/// acceptor has the same effect.
pub struct Acceptor<C: PayloadCodec> {
    server: Mutex<Option<TcpServer>>,
    task: Mutex<Option<JoinHandle<()>>>,
    registry: Arc<SessionRegistry<C>>,
    config: BrokerConfig,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    stopped: Arc<AtomicBool>,
}

impl<C: PayloadCodec> Acceptor<C> {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: BrokerConfig,
        registry: Arc<SessionRegistry<C>>,
    ) -> Result<Self> {
        let server = TcpServer::bind(addr, config.transport()).await?;
        let local_addr = server.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        tracing::info!(addr = %local_addr, "broker listening");
        Ok(Self {
            server: Mutex::new(Some(server)),
            task: Mutex::new(None),
            registry,
            config,
            local_addr,
            shutdown,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<C>> {
        &self.registry
    }

    /// Run the accept loop on a background task.
    pub fn spawn(&self) -> Result<()> {
        let server = self.take_server()?;
        let task = tokio::spawn(accept_loop(
            server,
            Arc::clone(&self.registry),
            self.config.clone(),
            self.shutdown.subscribe(),
            Arc::clone(&self.stopped),
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Run the accept loop on the current task until `stop` is called and every
    /// session has wound down.
    pub async fn serve(&self) -> Result<()> {
        let server = self.take_server()?;
        accept_loop(
            server,
            Arc::clone(&self.registry),
            self.config.clone(),
            self.shutdown.subscribe(),
            Arc::clone(&self.stopped),
        )
        .await;
        Ok(())
    }

    /// Stop accepting and close every session. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!(addr = %self.local_addr, "broker stopping");
        self.shutdown.send_replace(true);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wait for a spawned accept loop and its sessions to finish.
    pub async fn join(&self) -> Result<()> {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("join accept loop")?;
        }
        Ok(())
    }

    fn take_server(&self) -> Result<TcpServer> {
        if self.is_stopped() {
            return Err(anyhow!("acceptor already stopped"));
        }
        self.server
            .lock()
            .take()
            .ok_or_else(|| anyhow!("acceptor already started"))
    }
}

impl<C: PayloadCodec> Drop for Acceptor<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop<C: PayloadCodec>(
    server: TcpServer,
    registry: Arc<SessionRegistry<C>>,
    config: BrokerConfig,
    mut shutdown: watch::Receiver<bool>,
    stopped: Arc<AtomicBool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop_requested(&mut shutdown) => break,
            accepted = server.accept() => match accepted {
                Ok(connection) => {
                    tracing::debug!(
                        connection_id = %connection.info().id,
                        peer = %connection.info().peer_addr,
                        "accepted connection"
                    );
                    sessions.spawn(run_session(
                        Arc::clone(&registry),
                        connection,
                        config.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    if stopped.load(Ordering::Acquire) {
                        tracing::debug!(error = %err, "accept failed after stop");
                        break;
                    }
                    registry.report(ErrorOrigin::Accept, &err);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(err) = finished {
                    tracing::warn!(error = %err, "session task failed");
                }
            }
        }
    }
    drop(server);
    while let Some(finished) = sessions.join_next().await {
        if let Err(err) = finished {
            tracing::warn!(error = %err, "session task failed");
        }
    }
    tracing::info!("accept loop stopped");
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
