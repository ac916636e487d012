use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::net::TcpStream;
use tower::Service;
use tracing::info;

use crate::config::HandlerConfig;

/// Pid of the process that answered, so a handoff is visible to clients.
pub const SERVED_BY: &str = "x-served-by";

/// Answers one HTTP/1.1 request per connection with a fixed body after a
/// fixed delay. Stands in for real work so the handoff window is observable.
#[derive(Clone, Debug)]
pub struct DelayedResponse {
    delay: Duration,
    body: Bytes,
    read_timeout: Duration,
}

impl DelayedResponse {
    pub fn new(delay: Duration, body: impl Into<Bytes>, read_timeout: Duration) -> Self {
        Self {
            delay,
            body: body.into(),
            read_timeout,
        }
    }

    pub fn from_config(config: &HandlerConfig) -> Self {
        Self::new(config.delay(), config.body.clone(), config.read_timeout())
    }

    async fn respond(&self, request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let pid = std::process::id();
        let target = request.uri().to_string();

        info!(%target, pid, "Request started");
        tokio::time::sleep(self.delay).await;

        let mut response = Response::new(Full::new(self.body.clone()));
        response
            .headers_mut()
            .insert(SERVED_BY, HeaderValue::from(pid));

        info!(%target, pid, "Request done");
        Ok(response)
    }
}

impl Service<TcpStream> for DelayedResponse {
    type Response = ();
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, stream: TcpStream) -> Self::Future {
        let responder = self.clone();

        let fut = async move {
            let read_timeout = responder.read_timeout;
            let service = service_fn(move |request| {
                let responder = responder.clone();
                async move { responder.respond(request).await }
            });

            http1::Builder::new()
                .keep_alive(false)
                .timer(TokioTimer::new())
                .header_read_timeout(read_timeout)
                .serve_connection(TokioIo::new(stream), service)
                .await?;

            Ok(())
        };

        Box::pin(fut)
    }
}
