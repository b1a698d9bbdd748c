//! Prometheus metrics and a `/metrics` + `/healthz` HTTP endpoint per
//! stage (spec.md §6 Observability).
//!
//! Grounded on `other_examples/manifests/miketigerblue-rust-feed-ingestor`'s
//! `main.rs` (`prometheus::{Encoder, TextEncoder}` + `hyper::Server` serving
//! both routes from one `make_service_fn`), generalizing its single
//! ingestor's counters into the counter/histogram set
//! `original_source/services/rss_manager/metrics.py` defines
//! (`AMOUNT_OF_POSTS`, `TIME_OF_OPERATION`, `ERROR_COUNTER`) across every
//! stage of this pipeline.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use tracing::{error, info};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        prometheus::Opts::new("pipeline_requests_total", "Requests handled, labeled by stage and kind"),
        &["stage", "kind"],
    )
    .expect("static metric definition is valid");
    REGISTRY.register(Box::new(counter.clone())).expect("metric registered once");
    counter
});

pub static ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        prometheus::Opts::new("pipeline_errors_total", "Errors, labeled by stage and error kind"),
        &["stage", "error_kind"],
    )
    .expect("static metric definition is valid");
    REGISTRY.register(Box::new(counter.clone())).expect("metric registered once");
    counter
});

pub static OPERATION_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "pipeline_operation_duration_seconds",
            "Latency of one stage operation, labeled by stage and kind",
        ),
        &["stage", "kind"],
    )
    .expect("static metric definition is valid");
    REGISTRY.register(Box::new(histogram.clone())).expect("metric registered once");
    histogram
});

fn gather_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!(error = %e, "failed to encode metrics");
    }
    buffer
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = gather_metrics();
            let mime = TextEncoder::new().format_type().to_string();
            Ok(Response::builder()
                .header("Content-Type", mime)
                .body(Body::from(body))
                .expect("static response is well-formed"))
        }
        (&Method::GET, "/healthz") => Ok(Response::new(Body::from("OK"))),
        _ => Ok(Response::builder()
            .status(404)
            .body(Body::empty())
            .expect("static response is well-formed")),
    }
}

/// Serve `/metrics` and `/healthz` on `bind_addr` until the process exits.
/// Intended to be spawned as a background task; a bind failure is fatal for
/// the owning stage process (observability is not optional per spec.md §6).
pub async fn serve(bind_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr.parse()?;
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    info!(%addr, "starting metrics and health server");
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_metrics_includes_registered_series() {
        REQUESTS_TOTAL.with_label_values(&["poller", "poll_tick"]).inc();
        let text = String::from_utf8(gather_metrics()).unwrap();
        assert!(text.contains("pipeline_requests_total"));
    }
}
