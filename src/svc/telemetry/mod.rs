//! # Telemetry module
//!
//! This module expose the http server of the operator, it answers liveness
//! probes and exports metrics

use std::{convert::Infallible, future::Future, net::SocketAddr, time::Instant};

use hyper::{
    header::{self, HeaderValue},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::{error, info};

#[cfg(feature = "metrics")]
pub mod metrics;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request",
            "number of request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'kubernetes_operator_server_request' to not be already registered")
});

#[cfg(feature = "metrics")]
static SERVER_REQUEST_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_duration",
            "duration of request handled by the server",
        ),
        &["method", "path", "status", "unit"]
    )
    .expect("metrics 'kubernetes_operator_server_request_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("{0}")]
    Metrics(metrics::Error),
    #[error("failed to serve http requests on '{0}', {1}")]
    Serve(SocketAddr, hyper::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

/// dispatch the request to its handler, errors are answered as a json
/// document with an internal server error status
pub async fn router(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let begin = Instant::now();

    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => Ok(healthz()),
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics::handler().map_err(Error::Metrics),
        _ => Ok(not_found()),
    };

    let res = match result {
        Ok(res) => res,
        Err(err) => {
            error!(
                path = req.uri().path(),
                error = err.to_string(),
                "Failed to handle request",
            );
            failure(&err)
        }
    };

    let duration = begin.elapsed().as_micros();
    info!(
        method = req.method().as_str(),
        path = req.uri().path(),
        status = res.status().as_u16(),
        duration = duration as u64,
        "Receive request"
    );

    #[cfg(feature = "metrics")]
    {
        let status = res.status().as_u16().to_string();
        SERVER_REQUEST
            .with_label_values(&[req.method().as_str(), req.uri().path(), &status])
            .inc();
        SERVER_REQUEST_DURATION
            .with_label_values(&[req.method().as_str(), req.uri().path(), &status, "us"])
            .inc_by(duration as f64);
    }

    Ok(res)
}

pub fn healthz() -> Response<Body> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NO_CONTENT;
    res
}

pub fn not_found() -> Response<Body> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

fn failure(err: &Error) -> Response<Body> {
    let mut res = Response::default();

    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    *res.body_mut() = Body::from(serde_json::json!({ "error": err.to_string() }).to_string());
    res
}

/// listen on the given address until the shutdown future resolves
#[tracing::instrument(skip(shutdown))]
pub async fn serve<F>(addr: SocketAddr, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    let service = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(router)) });

    info!(addr = addr.to_string(), "Begin to listen on address");
    Server::try_bind(&addr)
        .map_err(|err| Error::Serve(addr, err))?
        .serve(service)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| Error::Serve(addr, err))
}
