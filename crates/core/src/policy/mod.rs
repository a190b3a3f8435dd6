//! Cache policy: expiration values, parsed directives, session settings and
//! the per-request [`CacheActions`] decision. Nothing here performs I/O.

pub mod actions;
pub mod directives;
pub mod expiration;
pub mod settings;

pub use actions::CacheActions;
pub use directives::CacheDirectives;
pub use expiration::{DO_NOT_CACHE, EXPIRE_IMMEDIATELY, ExpireAfter, NEVER_EXPIRE, StaleSetting, UrlExpiration};
pub use settings::{CacheSettings, FilterFn, KeyFn, MatchHeaders};
