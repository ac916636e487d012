use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};

use crate::listener::ListenerHandle;
use crate::shutdown::{Drain, DrainTimeout};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// Accept loop handing each connection to its own task.
pub struct Server<S> {
    service: S,
    drain: Drain,
    state: Arc<watch::Sender<ServerState>>,
}

/// Stops a [`Server`] from outside the accept loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    drain: Drain,
    state: Arc<watch::Sender<ServerState>>,
}

impl<S> Server<S>
where
    S: Service<TcpStream, Response = ()> + Clone + Send + 'static,
    S::Error: Into<anyhow::Error> + Send,
    S::Future: Send,
{
    pub fn new(service: S) -> Self {
        let (state, _) = watch::channel(ServerState::Starting);

        Self {
            service,
            drain: Drain::new(),
            state: Arc::new(state),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            drain: self.drain.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Runs until shutdown begins. The listener is dropped on return.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        // Held for the life of the loop so a drain cannot finish between an
        // accept and the guard of the connection it produced.
        let _accepting = self.drain.guard();
        let stop = self.drain.stop_token();

        if stop.is_cancelled() {
            return Ok(());
        }

        let addr = listener.local_addr()?;
        self.state.send_replace(ServerState::Serving);
        info!(addr = %addr, pid = std::process::id(), "Accepting connections");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        info!(addr = %addr, "Stopped accepting connections");

        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let guard = self.drain.guard();
        let force = self.drain.force_token();
        let service = self.service.clone();

        tokio::spawn(async move {
            let _guard = guard;

            tokio::select! {
                result = service.oneshot(stream) => {
                    if let Err(e) = result {
                        let e: anyhow::Error = e.into();
                        debug!(%peer, error = %e, "Handler failed");
                    }
                }
                _ = force.cancelled() => {
                    warn!(%peer, "Closing connection at drain deadline");
                }
            }
        });
    }
}

impl ShutdownHandle {
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Stops accepting immediately and waits up to `deadline` for in-flight
    /// connections. Connections still open at the deadline are closed.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), DrainTimeout> {
        self.state.send_replace(ServerState::Draining);
        let result = self.drain.drain(deadline).await;
        self.state.send_replace(ServerState::Stopped);

        result
    }
}

/// The one serving instance of this process.
pub struct ServerInstance {
    listener: ListenerHandle,
    shutdown: ShutdownHandle,
    task: JoinHandle<()>,
}

impl ServerInstance {
    /// Spawns the server on a duplicate of `listener`. Must be called from
    /// within a tokio runtime.
    pub fn start<S>(listener: ListenerHandle, service: S) -> io::Result<Self>
    where
        S: Service<TcpStream, Response = ()> + Clone + Send + 'static,
        S::Error: Into<anyhow::Error> + Send,
        S::Future: Send,
    {
        let accept_listener = listener.to_tokio()?;
        let server = Server::new(service);
        let shutdown = server.shutdown_handle();

        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(accept_listener).await {
                error!(error = %e, "Request server stopped unexpectedly");
            }
        });

        Ok(Self {
            listener,
            shutdown,
            task,
        })
    }

    pub fn listener(&self) -> &ListenerHandle {
        &self.listener
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn state(&self) -> ServerState {
        self.shutdown.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.shutdown.subscribe()
    }

    /// Closes this process's copy of the listener, then drains. Connections
    /// arriving afterwards go to whichever process still holds the socket,
    /// or are refused if none does.
    pub async fn shutdown(self, deadline: Duration) -> Result<(), DrainTimeout> {
        let ServerInstance {
            listener,
            shutdown,
            task,
        } = self;

        // The accept loop's duplicate closes as soon as it sees the stop.
        drop(listener);

        let result = shutdown.shutdown(deadline).await;
        if result.is_err() {
            task.abort();
        }

        result
    }
}
