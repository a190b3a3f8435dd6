//! Cache keys and the cache manager.

pub mod base;
pub mod key;

pub use base::{BaseCache, DeleteOptions, FilterOptions};
pub use key::{KeyOptions, create_key};
