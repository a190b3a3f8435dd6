//! Client code for reqcache.
//!
//! This crate provides the cached HTTP session, the network transport it
//! drives, and a process-wide patcher for code that does not hold a session.

pub mod error;
pub mod patcher;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::TransportError;
pub use session::{CacheDisabled, CachedSession, RequestOptions, ResponseHook};
pub use transport::{ReqwestTransport, Transport, TransportConfig};

pub use reqcache_core::{
    BaseCache, CacheConfig, CacheSettings, CachedRequest, CachedResponse, DeleteOptions, Error, ExpireAfter, FilterOptions,
    OriginResponse, StaleSetting,
};
