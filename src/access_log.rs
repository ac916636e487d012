use anyhow::Result;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};
use tokio::net::TcpStream;
use tower::{Layer, Service};
use tracing::{info, warn};

/// Logs the life of every connection handed to the wrapped service.
pub struct AccessLogLayer;

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLog<S>;

    fn layer(&self, service: S) -> Self::Service {
        AccessLog { service }
    }
}

#[derive(Clone)]
pub struct AccessLog<S> {
    service: S,
}

impl<S> Service<TcpStream> for AccessLog<S>
where
    S: Service<TcpStream, Response = (), Error = anyhow::Error>,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, stream: TcpStream) -> Self::Future {
        let peer = stream.peer_addr().ok();
        let pid = std::process::id();
        let inner = self.service.call(stream);

        let fut = async move {
            let started = Instant::now();
            info!(?peer, pid, "Connection opened");

            let result = inner.await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(()) => info!(?peer, pid, elapsed_ms, "Connection closed"),
                Err(e) => warn!(?peer, pid, elapsed_ms, error = %e, "Connection failed"),
            }

            result
        };

        Box::pin(fut)
    }
}
