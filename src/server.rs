//! Server builder and accept loop.
//!
//! The [`ServerBuilder`] provides a fluent API over [`ServerConfig`]. The
//! [`Server`] accepts MTA connections and drives one [`Session`] per
//! connection on its own task, with a fresh [`Milter`] from the factory.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use milterwire::protocol::actions;
//! use milterwire::session::Milter;
//! use milterwire::Server;
//!
//! struct Accepting;
//!
//! #[async_trait]
//! impl Milter for Accepting {}
//!
//! #[tokio::main]
//! async fn main() -> milterwire::Result<()> {
//!     let server = Server::builder()
//!         .listen("inet:127.0.0.1:10025")
//!         .actions(actions::ADDHDRS)
//!         .bind(|| Accepting)
//!         .await?;
//!
//!     server.serve_until(tokio::signal::ctrl_c()).await
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, SessionConfig};
use crate::error::{MilterError, Result};
use crate::session::{Milter, Session};
use crate::transport::{Connection, ListenAddr, MilterListener};

/// Pause after a failed accept, so a persistent error such as EMFILE does
/// not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Builder for configuring and binding a [`Server`].
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Listen address, `inet:host:port` or `unix:/path`.
    pub fn listen(mut self, addr: &str) -> Self {
        self.config.listen = addr.to_string();
        self
    }

    /// Connections served at once.
    ///
    /// Default: 256
    pub fn max_connections(mut self, limit: usize) -> Self {
        self.config.max_connections = limit;
        self
    }

    /// Action bits to request.
    pub fn actions(mut self, actions: u32) -> Self {
        self.config.session.actions = actions;
        self
    }

    /// Protocol bits to request.
    pub fn protocol(mut self, protocol: u32) -> Self {
        self.config.session.protocol = protocol;
        self
    }

    /// Largest accepted frame.
    ///
    /// Default: 16 MiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.session.max_frame_size = size;
        self
    }

    /// Replace all session options.
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener. `factory` is called once per accepted connection.
    pub async fn bind<F, M>(self, factory: F) -> Result<Server<F>>
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Milter + 'static,
    {
        let addr: ListenAddr = self.config.listen.parse()?;
        let listener = MilterListener::bind(&addr).await?;
        Ok(Server {
            listener,
            factory: Arc::new(factory),
            session: Arc::new(self.config.session),
            limit: Arc::new(Semaphore::new(self.config.max_connections.max(1))),
        })
    }
}

/// A bound milter server.
pub struct Server<F> {
    listener: MilterListener,
    factory: Arc<F>,
    session: Arc<SessionConfig>,
    limit: Arc<Semaphore>,
}

impl Server<()> {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

impl<F, M> Server<F>
where
    F: Fn() -> M + Send + Sync + 'static,
    M: Milter + 'static,
{
    /// The bound address.
    pub fn local_addr(&self) -> Result<ListenAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending::<()>()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Sessions already running keep going on their own tasks.
    pub async fn serve_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future,
    {
        info!(addr = %self.listener.local_addr()?, "milter server started");
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let conn = tokio::select! {
                _ = &mut shutdown => break,
                conn = self.listener.accept() => conn,
            };

            match conn {
                Ok(conn) => self.spawn_session(conn, permit),
                Err(e) => accept_failed(&e).await,
            }
        }

        info!("milter server stopped");
        Ok(())
    }

    fn spawn_session(&self, conn: Connection, permit: tokio::sync::OwnedSemaphorePermit) {
        let milter = (self.factory)();
        let config = self.session.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let Connection {
                reader,
                writer,
                peer,
            } = conn;
            debug!(peer = %peer, "MTA connected");

            let mut session = Session::new(milter, writer, &config);
            if let Err(e) = session.run(reader).await {
                error!(peer = %peer, error = %e, "session ended with error");
            }
            debug!(peer = %peer, frames = session.frames_written(), "MTA disconnected");
        });
    }
}

async fn accept_failed(e: &MilterError) {
    warn!(error = %e, backoff_ms = ACCEPT_BACKOFF.as_millis() as u64, "accept failed");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}
