//! Top-level control loop: serve, wait for a signal, hand the listener to a
//! successor, then drain and exit.

use anyhow::{bail, Context, Result};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tower::Service;
use tracing::{error, info, warn};

use crate::config::{Config, TerminatePolicy};
use crate::listener::acquire_listener;
use crate::server::ServerInstance;
use crate::shutdown::DrainTimeout;
use crate::signals::RestartSignal;
use crate::successor::{Launch, SuccessorProcess};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Starting,
    Listening,
    Restarting,
    ShuttingDown,
    Terminated,
}

/// How the coordinator reached `Terminated`.
#[derive(Debug)]
pub struct Report {
    pub signal: RestartSignal,
    pub successor: Option<SuccessorProcess>,
    pub failed_restarts: usize,
    pub drain: Result<(), DrainTimeout>,
}

pub struct Coordinator<L> {
    instance: ServerInstance,
    launcher: L,
    drain_timeout: Duration,
    on_terminate: TerminatePolicy,
    state: watch::Sender<CoordinatorState>,
}

impl<L: Launch> Coordinator<L> {
    /// Acquires the listener (bound or inherited) and starts serving on it.
    pub fn start<S>(reborn: bool, config: &Config, service: S, launcher: L) -> Result<Self>
    where
        S: Service<TcpStream, Response = ()> + Clone + Send + 'static,
        S::Error: Into<anyhow::Error> + Send,
        S::Future: Send,
    {
        let listener = acquire_listener(reborn, &config.addr, config.backlog)?;
        let instance = ServerInstance::start(listener, service)
            .context("Unable to start the request server")?;

        Ok(Self::new(instance, launcher, config))
    }

    pub fn new(instance: ServerInstance, launcher: L, config: &Config) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Starting);

        Self {
            instance,
            launcher,
            drain_timeout: config.drain_timeout(),
            on_terminate: config.on_terminate,
            state,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Runs until the instance has been drained. `subscribe` is called on
    /// entering `Listening`; its receiver is dropped before restarting so a
    /// signal during handoff is never seen.
    pub async fn run<F>(self, mut subscribe: F) -> Result<Report>
    where
        F: FnMut() -> io::Result<mpsc::Receiver<RestartSignal>>,
    {
        let Coordinator {
            instance,
            launcher,
            drain_timeout,
            on_terminate,
            state,
        } = self;

        let mut failed_restarts = 0;

        let (signal, successor) = loop {
            state.send_replace(CoordinatorState::Listening);
            info!(
                addr = %instance.local_addr(),
                server = ?instance.state(),
                "Waiting for reload or terminate signal"
            );

            let mut signals = subscribe().context("Unable to subscribe to signals")?;
            let signal = match signals.recv().await {
                Some(signal) => signal,
                None => bail!("Signal subscription closed without delivering a signal"),
            };
            drop(signals);

            state.send_replace(CoordinatorState::Restarting);

            if signal == RestartSignal::Terminate && on_terminate == TerminatePolicy::Shutdown {
                info!("Terminating without a successor");
                break (signal, None);
            }

            info!(?signal, "Signal causes reloading");
            match launcher.launch(instance.listener()) {
                Ok(successor) => {
                    info!(
                        pid = successor.pid,
                        fd = successor.inherited_fd,
                        reborn = successor.reborn,
                        "Successor is taking over the listener"
                    );
                    break (signal, Some(successor));
                }
                Err(e) => {
                    failed_restarts += 1;
                    error!(error = %e, "Restart aborted, continuing to serve");
                }
            }
        };

        state.send_replace(CoordinatorState::ShuttingDown);
        let drain = instance.shutdown(drain_timeout).await;
        match &drain {
            Ok(()) => info!("Graceful shutdown complete"),
            Err(e) => warn!(error = %e, "Forcing exit before every connection finished"),
        }

        state.send_replace(CoordinatorState::Terminated);

        Ok(Report {
            signal,
            successor,
            failed_restarts,
            drain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{bind_listener, ListenerHandle};
    use crate::successor::SuccessorError;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Hands out queued results and records the listener it was given.
    struct ScriptedLauncher {
        results: Mutex<VecDeque<Result<SuccessorProcess, SuccessorError>>>,
        calls: mpsc::UnboundedSender<(RawFd, SocketAddr)>,
    }

    impl Launch for ScriptedLauncher {
        fn launch(&self, listener: &ListenerHandle) -> Result<SuccessorProcess, SuccessorError> {
            let _ = self.calls.send((listener.as_raw_fd(), listener.local_addr()));
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected launch")
        }
    }

    fn launcher(
        results: Vec<Result<SuccessorProcess, SuccessorError>>,
    ) -> (ScriptedLauncher, mpsc::UnboundedReceiver<(RawFd, SocketAddr)>) {
        let (calls, calls_rx) = mpsc::unbounded_channel();
        let launcher = ScriptedLauncher {
            results: Mutex::new(results.into()),
            calls,
        };
        (launcher, calls_rx)
    }

    fn spawned(pid: u32) -> Result<SuccessorProcess, SuccessorError> {
        Ok(SuccessorProcess {
            pid,
            inherited_fd: 3,
            reborn: true,
        })
    }

    fn spawn_failure() -> Result<SuccessorProcess, SuccessorError> {
        Err(SuccessorError::Spawn {
            program: "/nonexistent".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        })
    }

    /// One receiver per subscription, fed by the returned senders.
    fn scripted_signals(
        count: usize,
    ) -> (
        Vec<mpsc::Sender<RestartSignal>>,
        impl FnMut() -> io::Result<mpsc::Receiver<RestartSignal>>,
    ) {
        let (senders, receivers): (Vec<_>, VecDeque<_>) =
            (0..count).map(|_| mpsc::channel(1)).unzip();
        let mut receivers = receivers;

        let subscribe = move || {
            receivers
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no more subscriptions"))
        };
        (senders, subscribe)
    }

    fn instance(delay: Duration) -> ServerInstance {
        let service = tower::service_fn(move |mut stream: TcpStream| async move {
            tokio::time::sleep(delay).await;
            stream.write_all(b"served").await?;
            Ok::<_, anyhow::Error>(())
        });

        ServerInstance::start(bind_listener("127.0.0.1:0", 16).unwrap(), service).unwrap()
    }

    async fn request(addr: SocketAddr) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    async fn wait_for(rx: &mut watch::Receiver<CoordinatorState>, wanted: CoordinatorState) {
        while *rx.borrow() != wanted {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn reload_spawns_successor_then_drains() {
        let (launcher, mut calls) = launcher(vec![spawned(4242)]);
        let (senders, subscribe) = scripted_signals(1);
        let instance = instance(Duration::from_millis(300));
        let addr = instance.local_addr();

        let coordinator = Coordinator::new(instance, launcher, &Config::default());
        let mut states = coordinator.subscribe_state();
        let run = tokio::spawn(coordinator.run(subscribe));
        wait_for(&mut states, CoordinatorState::Listening).await;

        // In flight when the signal lands.
        let in_flight = tokio::spawn(request(addr));
        tokio::time::sleep(Duration::from_millis(50)).await;
        senders[0].send(RestartSignal::Reload).await.unwrap();

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.signal, RestartSignal::Reload);
        assert_eq!(report.successor.map(|s| s.pid), Some(4242));
        assert_eq!(report.failed_restarts, 0);
        assert_eq!(report.drain, Ok(()));
        assert_eq!(*states.borrow(), CoordinatorState::Terminated);

        assert_eq!(calls.recv().await.map(|(_, a)| a), Some(addr));
        assert_eq!(in_flight.await.unwrap(), b"served");
    }

    #[tokio::test]
    async fn failed_spawn_keeps_serving() {
        let (launcher, mut calls) = launcher(vec![spawn_failure(), spawned(7)]);
        let (senders, subscribe) = scripted_signals(2);
        let instance = instance(Duration::ZERO);
        let addr = instance.local_addr();

        let coordinator = Coordinator::new(instance, launcher, &Config::default());
        let mut states = coordinator.subscribe_state();
        let run = tokio::spawn(coordinator.run(subscribe));
        wait_for(&mut states, CoordinatorState::Listening).await;

        senders[0].send(RestartSignal::Reload).await.unwrap();
        let first = calls.recv().await.unwrap();
        wait_for(&mut states, CoordinatorState::Listening).await;

        // Same listener, still answering.
        assert_eq!(request(addr).await, b"served");

        senders[1].send(RestartSignal::Terminate).await.unwrap();
        let second = calls.recv().await.unwrap();
        assert_eq!(first, second);

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.failed_restarts, 1);
        assert_eq!(report.signal, RestartSignal::Terminate);
        assert_eq!(report.successor.map(|s| s.pid), Some(7));
    }

    #[tokio::test]
    async fn terminate_can_skip_the_successor() {
        let (launcher, mut calls) = launcher(vec![]);
        let (senders, subscribe) = scripted_signals(1);
        let config = Config {
            on_terminate: TerminatePolicy::Shutdown,
            ..Config::default()
        };

        let coordinator = Coordinator::new(instance(Duration::ZERO), launcher, &config);
        senders[0].send(RestartSignal::Terminate).await.unwrap();

        let report = coordinator.run(subscribe).await.unwrap();
        assert!(report.successor.is_none());
        assert_eq!(report.drain, Ok(()));
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn descriptor_extraction_failure_aborts_restart() {
        let extraction_failure = Err(SuccessorError::DescriptorExtraction(io::Error::from(
            io::ErrorKind::Other,
        )));
        let (launcher, mut calls) = launcher(vec![extraction_failure, spawned(11)]);
        let (senders, subscribe) = scripted_signals(2);
        let instance = instance(Duration::ZERO);
        let addr = instance.local_addr();

        let coordinator = Coordinator::new(instance, launcher, &Config::default());
        let mut states = coordinator.subscribe_state();
        let run = tokio::spawn(coordinator.run(subscribe));
        wait_for(&mut states, CoordinatorState::Listening).await;

        senders[0].send(RestartSignal::Reload).await.unwrap();
        calls.recv().await.unwrap();
        wait_for(&mut states, CoordinatorState::Listening).await;
        assert_eq!(request(addr).await, b"served");

        senders[1].send(RestartSignal::Reload).await.unwrap();
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.failed_restarts, 1);
        assert_eq!(report.successor.map(|s| s.pid), Some(11));
    }

    #[tokio::test]
    async fn shutdown_policy_refuses_connections_while_draining() {
        let (launcher, _calls) = launcher(vec![]);
        let (senders, subscribe) = scripted_signals(1);
        let config = Config {
            on_terminate: TerminatePolicy::Shutdown,
            ..Config::default()
        };
        let instance = instance(Duration::from_millis(500));
        let addr = instance.local_addr();

        let coordinator = Coordinator::new(instance, launcher, &config);
        let mut states = coordinator.subscribe_state();
        let run = tokio::spawn(coordinator.run(subscribe));
        wait_for(&mut states, CoordinatorState::Listening).await;

        let in_flight = tokio::spawn(request(addr));
        tokio::time::sleep(Duration::from_millis(50)).await;
        senders[0].send(RestartSignal::Terminate).await.unwrap();
        wait_for(&mut states, CoordinatorState::ShuttingDown).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(TcpStream::connect(addr).await.is_err());
        assert_eq!(in_flight.await.unwrap(), b"served");

        let report = run.await.unwrap().unwrap();
        assert!(report.successor.is_none());
        assert_eq!(report.drain, Ok(()));
    }

    #[tokio::test]
    async fn drain_timeout_still_terminates() {
        let (launcher, _calls) = launcher(vec![spawned(9)]);
        let (senders, subscribe) = scripted_signals(1);
        let config = Config {
            drain_timeout_secs: 1,
            ..Config::default()
        };
        let instance = instance(Duration::from_secs(60));
        let addr = instance.local_addr();

        let coordinator = Coordinator::new(instance, launcher, &config);
        let mut states = coordinator.subscribe_state();
        let run = tokio::spawn(coordinator.run(subscribe));
        wait_for(&mut states, CoordinatorState::Listening).await;

        let _stuck = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        senders[0].send(RestartSignal::Reload).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("drain overran its deadline")
            .unwrap()
            .unwrap();
        assert!(matches!(report.drain, Err(DrainTimeout { remaining: 1, .. })));
        assert_eq!(*states.borrow(), CoordinatorState::Terminated);
    }

    #[tokio::test]
    async fn closed_signal_source_is_an_error() {
        let (launcher, _calls) = launcher(vec![]);
        let (senders, subscribe) = scripted_signals(1);
        drop(senders);

        let coordinator = Coordinator::new(instance(Duration::ZERO), launcher, &Config::default());
        assert!(coordinator.run(subscribe).await.is_err());
    }
}
