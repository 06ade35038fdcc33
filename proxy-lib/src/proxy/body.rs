//! The boxed response body type shared across the rewrite and error-response
//! paths.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub type RespBody = BoxBody<Bytes, hyper::Error>;

pub fn empty() -> RespBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full(bytes: impl Into<Bytes>) -> RespBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}
