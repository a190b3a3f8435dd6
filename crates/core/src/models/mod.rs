//! Request and response types stored by the cache.

pub mod headers;
pub mod request;
pub mod response;

pub use request::CachedRequest;
pub use response::{CachedResponse, OriginResponse};
