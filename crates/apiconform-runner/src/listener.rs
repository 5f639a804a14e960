//! Local HTTP listener for async callbacks
//!
//! Every inbound call is captured with its body, answered with the
//! configured status and handed to [`RunContext::record_inbound`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tiny_http::{Response, Server};
use tracing::{debug, info, warn};

use apiconform_core::{CapturedRequest, CapturedResponse};

use crate::context::RunContext;
use crate::error::RunError;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Running listener; stops when dropped.
#[derive(Debug)]
pub struct Listener {
    url: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `address` and start serving; the base URL is published to `ctx`
    /// as the listener URL.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Listener`] if the address cannot be bound.
    pub fn bind(ctx: Arc<RunContext>, address: &str) -> Result<Self, RunError> {
        let server =
            Server::http(address).map_err(|e| RunError::Listener(format!("{address}: {e}")))?;
        let local = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| RunError::Listener(format!("{address}: not an IP address")))?;
        let url = format!("http://{local}");
        ctx.set_listener_url(&url);

        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("apiconform-listener".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || serve(&server, &ctx, &stop)
            })
            .map_err(|e| RunError::Listener(e.to_string()))?;

        info!(url = %url, "listener started");
        Ok(Self {
            url,
            stop,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop accepting calls and wait for the serving thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("listener thread panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn serve(server: &Server, ctx: &RunContext, stop: &AtomicBool) {
    let status = ctx.config().listener.status;
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(ACCEPT_POLL) {
            Ok(Some(request)) => handle(request, ctx, status),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "listener stopped");
                return;
            }
        }
    }
    debug!("listener shut down");
}

fn handle(mut request: tiny_http::Request, ctx: &RunContext, status: u16) {
    let method = request.method().to_string();
    let url = request.url().to_string();
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .map(|h| (h.field.to_string(), h.value.to_string()))
        .collect();

    let status = match CapturedRequest::from_reader(method, url, headers, request.as_reader()) {
        Ok(captured) => {
            let seq = ctx.record_inbound(captured, Some(CapturedResponse::new(status)));
            debug!(?seq, "callback received");
            status
        }
        Err(e) => {
            warn!(error = %e, "unreadable callback body");
            400
        }
    };

    if let Err(e) = request.respond(Response::empty(status)) {
        warn!(error = %e, "callback response failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiconform_core::{Config, ListenerConfig, SchemaRegistry};

    use crate::transport::Transports;

    fn ctx(status: u16) -> Arc<RunContext> {
        let config = Config {
            listener: ListenerConfig {
                address: Some("127.0.0.1:0".into()),
                status,
            },
            ..Config::default()
        };
        Arc::new(
            RunContext::new(
                config,
                Arc::new(SchemaRegistry::new()),
                Transports::new("in-process"),
            )
            .unwrap(),
        )
    }

    fn put(url: &str, body: &str) -> u16 {
        reqwest::blocking::Client::builder()
            .no_proxy()
            .build()
            .unwrap()
            .put(url)
            .header("Content-Type", "application/json")
            .header("X-Signature", "abc")
            .body(body.to_string())
            .send()
            .unwrap()
            .status()
            .as_u16()
    }

    #[test]
    fn watched_calls_reach_the_request_log() {
        let ctx = ctx(202);
        let listener = Listener::bind(Arc::clone(&ctx), "127.0.0.1:0").unwrap();
        assert_eq!(ctx.listener_url().as_deref(), Some(listener.url()));

        let _watch = ctx.watch("bob");
        let status = put(&format!("{}/bob/webhook?n=1", listener.url()), r#"{"id":"Tent!"}"#);
        assert_eq!(status, 202);

        let log = ctx.request_log();
        assert_eq!(log.len(), 1);
        let exchange = &log[0].exchange;
        assert_eq!(log[0].identity.as_deref(), Some("bob"));
        assert_eq!(exchange.request.method, "PUT");
        assert_eq!(exchange.request.path, "/bob/webhook");
        assert_eq!(exchange.request.params["n"], "1");
        assert_eq!(exchange.request.header("x-signature"), Some("abc"));
        assert_eq!(exchange.request.json()["id"], "Tent!");
        assert_eq!(exchange.response.as_ref().map(|r| r.status), Some(202));
        listener.shutdown();
    }

    #[test]
    fn unwatched_calls_are_answered_but_not_logged() {
        let ctx = ctx(200);
        let listener = Listener::bind(Arc::clone(&ctx), "127.0.0.1:0").unwrap();
        assert_eq!(put(&format!("{}/carol/webhook", listener.url()), "{}"), 200);
        assert!(ctx.request_log().is_empty());
    }

    #[test]
    fn bad_address_is_a_listener_error() {
        let err = Listener::bind(ctx(200), "not an address").unwrap_err();
        assert!(matches!(err, RunError::Listener(_)));
    }
}
