//! Process-wide caching for code that does not hold a session.
//!
//! [`get`] and [`send`] go through the ambient session: the installed
//! [`CachedSession`] if there is one, otherwise a plain transport that never
//! touches a cache. [`install_cache`] and [`uninstall_cache`] swap the ambient
//! session; [`enabled`] and [`disabled`] do the same for the lifetime of a
//! guard.
//!
//! The ambient session is global mutable state. Concurrent installs race;
//! code that needs isolation should use a [`CachedSession`] directly.

use std::sync::{Arc, PoisonError, RwLock};

use reqcache_core::{BaseCache, CacheConfig, CachedRequest, CachedResponse, DeleteOptions, Error};

use crate::session::CachedSession;
use crate::transport::{ReqwestTransport, Transport, TransportConfig};

static INSTALLED: RwLock<Option<CachedSession>> = RwLock::new(None);
static PLAIN_TRANSPORT: RwLock<Option<Arc<dyn Transport>>> = RwLock::new(None);

fn installed() -> Option<CachedSession> {
    INSTALLED.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn replace(session: Option<CachedSession>) -> Option<CachedSession> {
    std::mem::replace(&mut *INSTALLED.write().unwrap_or_else(PoisonError::into_inner), session)
}

/// Open the configured cache and make it the ambient session.
pub async fn install_cache(config: &CacheConfig) -> Result<(), Error> {
    let session = CachedSession::open(config).await?;
    install_session(session);
    Ok(())
}

/// Make `session` the ambient session, replacing any installed one.
pub fn install_session(session: CachedSession) {
    tracing::debug!(cache_name = %session.cache().cache_name(), "installing cache");
    replace(Some(session));
}

/// Restore the uncached ambient session.
pub fn uninstall_cache() {
    if replace(None).is_some() {
        tracing::debug!("uninstalled cache");
    }
}

pub fn is_installed() -> bool {
    INSTALLED.read().unwrap_or_else(PoisonError::into_inner).is_some()
}

/// The installed session, if any.
pub fn get_session() -> Option<CachedSession> {
    installed()
}

/// The installed cache, if any.
pub fn get_cache() -> Option<BaseCache> {
    installed().map(|session| session.cache().clone())
}

/// Clear the installed cache; a no-op when none is installed.
pub async fn clear() -> Result<(), Error> {
    match get_cache() {
        Some(cache) => cache.clear().await,
        None => Ok(()),
    }
}

/// Delete from the installed cache; returns 0 when none is installed.
pub async fn delete(options: DeleteOptions) -> Result<usize, Error> {
    match get_cache() {
        Some(cache) => cache.delete(options).await,
        None => Ok(0),
    }
}

/// Transport used by the ambient session while no cache is installed.
pub fn set_plain_transport(transport: Arc<dyn Transport>) {
    *PLAIN_TRANSPORT.write().unwrap_or_else(PoisonError::into_inner) = Some(transport);
}

fn plain_transport() -> Result<Arc<dyn Transport>, Error> {
    if let Some(transport) = PLAIN_TRANSPORT.read().unwrap_or_else(PoisonError::into_inner).clone() {
        return Ok(transport);
    }
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(TransportConfig::default())?);
    set_plain_transport(transport.clone());
    Ok(transport)
}

/// `GET` through the ambient session.
pub async fn get(url: &str) -> Result<CachedResponse, Error> {
    send(CachedRequest::get(url)).await
}

/// Send through the ambient session.
pub async fn send(request: CachedRequest) -> Result<CachedResponse, Error> {
    match installed() {
        Some(session) => session.send(request).await,
        None => {
            let response = plain_transport()?.send(&request).await?;
            Ok(CachedResponse::from_response(&response, None))
        }
    }
}

/// Restores the previously installed session (or none) on drop.
#[derive(Debug)]
#[must_use = "the previous session is restored when the guard is dropped"]
pub struct PatchGuard {
    previous: Option<CachedSession>,
}

impl Drop for PatchGuard {
    fn drop(&mut self) {
        replace(self.previous.take());
    }
}

/// Install a cache until the guard is dropped.
pub async fn enabled(config: &CacheConfig) -> Result<PatchGuard, Error> {
    let session = CachedSession::open(config).await?;
    Ok(enabled_with(session))
}

/// Install `session` until the guard is dropped.
pub fn enabled_with(session: CachedSession) -> PatchGuard {
    PatchGuard { previous: replace(Some(session)) }
}

/// Uninstall any cache until the guard is dropped.
pub fn disabled() -> PatchGuard {
    PatchGuard { previous: replace(None) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use reqcache_core::backends::memory;
    use tokio::sync::Mutex;

    // Tests share the ambient session.
    static SERIAL: Mutex<()> = Mutex::const_new(());

    const URL: &str = "https://example.com/data";

    fn session(transport: &MockTransport) -> CachedSession {
        let cache = memory::open_cache("patched", &CacheConfig::default()).unwrap();
        CachedSession::new(cache, Arc::new(transport.clone()))
    }

    #[tokio::test]
    async fn test_install_uninstall_restores_plain_session() {
        let _serial = SERIAL.lock().await;
        uninstall_cache();
        assert!(!is_installed());

        install_session(session(&MockTransport::ok("body", &[])));
        assert!(is_installed());
        assert_eq!(get_cache().unwrap().cache_name(), "patched");

        uninstall_cache();
        assert!(!is_installed());
        assert!(get_cache().is_none());
    }

    #[tokio::test]
    async fn test_ambient_get_uses_installed_cache() {
        let _serial = SERIAL.lock().await;
        let cached = MockTransport::ok("cached", &[]);
        install_session(session(&cached));

        assert!(!get(URL).await.unwrap().from_cache);
        assert!(get(URL).await.unwrap().from_cache);
        assert_eq!(cached.calls(), 1);

        let deleted = delete(DeleteOptions::urls([URL])).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(!get(URL).await.unwrap().from_cache);

        clear().await.unwrap();
        assert!(get_cache().unwrap().is_empty().await.unwrap());
        uninstall_cache();
    }

    #[tokio::test]
    async fn test_plain_session_when_uninstalled() {
        let _serial = SERIAL.lock().await;
        uninstall_cache();
        let plain = MockTransport::ok("plain", &[]);
        set_plain_transport(Arc::new(plain.clone()));

        get(URL).await.unwrap();
        let response = get(URL).await.unwrap();
        assert!(!response.from_cache);
        assert_eq!(plain.calls(), 2);
        assert_eq!(clear().await.ok(), Some(()));
        assert_eq!(delete(DeleteOptions::urls([URL])).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_guards_restore_previous_state() {
        let _serial = SERIAL.lock().await;
        uninstall_cache();
        let outer = session(&MockTransport::ok("outer", &[]));
        install_session(outer);

        {
            let _off = disabled();
            assert!(!is_installed());
            {
                let inner = session(&MockTransport::ok("inner", &[]));
                let _on = enabled_with(inner);
                assert!(is_installed());
            }
            assert!(!is_installed());
        }
        assert!(is_installed());
        uninstall_cache();
    }
}
