//! # Metrics module
//!
//! This module export the metrics gathered by the operator using the
//! prometheus text format

use hyper::{
    header::{self, HeaderValue, InvalidHeaderValue},
    Body, Response, StatusCode,
};
use prometheus::{gather, Encoder, TextEncoder};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize metrics, {0}")]
    Serialize(prometheus::Error),
    #[error("failed to parse header value given by prometheus, {0}")]
    InvalidHeader(InvalidHeaderValue),
}

/// returns the encoded metrics gathered from the registry
pub fn handler() -> Result<Response<Body>, Error> {
    let families = gather();
    let encoder = TextEncoder::new();
    let mut buf = vec![];
    encoder
        .encode(&families, &mut buf)
        .map_err(Error::Serialize)?;

    let mut res = Response::default();
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(encoder.format_type()).map_err(Error::InvalidHeader)?,
    );

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(buf);

    Ok(res)
}
