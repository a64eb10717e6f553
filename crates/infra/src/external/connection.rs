//! Ownership of the single stateful ERP session.
//!
//! Two locks:
//! - the call lock admits one business call at a time process-wide; it is
//!   held by [`ConnectionGuard`] and released when the guard drops;
//! - the session lock guards opening, replacing and closing the session.
//!
//! `is_connected` reads an atomic flag and never queues behind either lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::ErpError;
use crate::retry::RetryPolicy;

/// Opens and closes sessions for one ERP variant.
///
/// `open` classifies its own failures: a `Transient` error makes the manager
/// back off and try again, a `Permanent` one is surfaced immediately.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    async fn open(&self) -> Result<Self::Session, ErpError>;

    /// Best effort; failures are logged by the implementation.
    async fn close(&self, session: &Self::Session);
}

pub struct ConnectionManager<F: SessionFactory> {
    factory: F,
    call_lock: Mutex<()>,
    session: Mutex<Option<Arc<F::Session>>>,
    connected: AtomicBool,
    reconnect: RetryPolicy,
}

impl<F: SessionFactory> ConnectionManager<F> {
    /// `reconnect.max_attempts` bounds how many times a session open is tried.
    pub fn new(factory: F, reconnect: RetryPolicy) -> Self {
        Self {
            factory,
            call_lock: Mutex::new(()),
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
            reconnect,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Wait for exclusive use of a healthy session.
    pub async fn acquire(&self) -> Result<ConnectionGuard<'_, F>, ErpError> {
        let permit = self.call_lock.lock().await;
        let session = self.ensure_connected().await?;
        Ok(ConnectionGuard {
            manager: self,
            session,
            _permit: permit,
        })
    }

    /// Return the live session, opening one if needed.
    ///
    /// Opening is retried with backoff while it fails transiently, up to the
    /// configured attempt count; exhaustion is reported as permanent.
    pub async fn ensure_connected(&self) -> Result<Arc<F::Session>, ErpError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        let attempts = self.reconnect.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.factory.open().await {
                Ok(session) => {
                    let session = Arc::new(session);
                    *slot = Some(Arc::clone(&session));
                    self.connected.store(true, Ordering::Release);
                    info!(attempt, "ERP session opened");
                    return Ok(session);
                }
                Err(ErpError::Permanent(msg)) => {
                    self.connected.store(false, Ordering::Release);
                    warn!(attempt, error = %msg, "ERP login rejected");
                    return Err(ErpError::Permanent(msg));
                }
                Err(ErpError::Transient(msg)) => {
                    warn!(attempt, max_attempts = attempts, error = %msg, "ERP session open failed");
                    last_error = Some(msg);
                    if attempt < attempts {
                        tokio::time::sleep(self.reconnect.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        Err(ErpError::Permanent(format!(
            "could not open ERP session after {attempts} attempts: {}",
            last_error.unwrap_or_default()
        )))
    }

    /// Drop the current session so the next `acquire` opens a fresh one.
    async fn reset(&self) {
        let taken = self.session.lock().await.take();
        self.connected.store(false, Ordering::Release);
        if let Some(session) = taken {
            self.factory.close(&session).await;
            debug!("ERP session discarded");
        }
    }

    /// Close the session (logout). Waits for an in-flight call to finish.
    pub async fn shutdown(&self) {
        let _permit = self.call_lock.lock().await;
        self.reset().await;
        info!("ERP connection shut down");
    }
}

/// Exclusive use of the ERP session for one call.
///
/// Dropping the guard releases the call lock, on every exit path.
pub struct ConnectionGuard<'a, F: SessionFactory> {
    manager: &'a ConnectionManager<F>,
    session: Arc<F::Session>,
    _permit: MutexGuard<'a, ()>,
}

impl<F: SessionFactory> ConnectionGuard<'_, F> {
    pub fn session(&self) -> &F::Session {
        &self.session
    }

    /// Close the session after a fault so the next caller reconnects.
    pub async fn invalidate(&self) {
        self.manager.reset().await;
    }

    /// Pass a call's result through, invalidating the session on transient faults.
    pub async fn finish<T>(self, result: Result<T, ErpError>) -> Result<T, ErpError> {
        let transient = match &result {
            Err(ErpError::Transient(msg)) => {
                warn!(error = %msg, "transient ERP fault, session will be recreated");
                true
            }
            _ => false,
        };
        if transient {
            self.invalidate().await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Fails the first `fail_first` opens with the given error kind.
    struct FlakyFactory {
        opens: AtomicU32,
        closes: AtomicU32,
        fail_first: u32,
        permanent: bool,
    }

    impl FlakyFactory {
        fn new(fail_first: u32, permanent: bool) -> Self {
            Self {
                opens: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                fail_first,
                permanent,
            }
        }
    }

    #[async_trait]
    impl SessionFactory for FlakyFactory {
        type Session = u32;

        async fn open(&self) -> Result<u32, ErpError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(if self.permanent {
                    ErpError::permanent("bad credentials")
                } else {
                    ErpError::transient("connection refused")
                });
            }
            Ok(n)
        }

        async fn close(&self, _session: &u32) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn reconnect_retries_transient_open_failures() {
        let manager = ConnectionManager::new(FlakyFactory::new(2, false), policy(3));
        let guard = manager.acquire().await.unwrap();
        assert_eq!(*guard.session(), 3);
        drop(guard);
        assert!(manager.is_connected());
        assert_eq!(manager.factory().opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reconnect_is_bounded_and_reports_permanent() {
        let manager = ConnectionManager::new(FlakyFactory::new(10, false), policy(3));
        let err = manager.acquire().await.err().unwrap();
        assert!(!err.is_transient());
        assert_eq!(manager.factory().opens.load(Ordering::SeqCst), 3);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn permanent_login_failure_is_not_retried() {
        let manager = ConnectionManager::new(FlakyFactory::new(1, true), policy(5));
        assert!(manager.acquire().await.is_err());
        assert_eq!(manager.factory().opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_result_invalidates_session() {
        let manager = ConnectionManager::new(FlakyFactory::new(0, false), policy(1));

        let guard = manager.acquire().await.unwrap();
        let result: Result<(), _> = guard.finish(Err(ErpError::transient("HTTP 401"))).await;
        assert!(result.is_err());
        assert!(!manager.is_connected());
        assert_eq!(manager.factory().closes.load(Ordering::SeqCst), 1);

        let guard = manager.acquire().await.unwrap();
        assert_eq!(*guard.session(), 2, "a fresh session is opened");
        let ok = guard.finish(Ok(7)).await.unwrap();
        assert_eq!(ok, 7);
        assert!(manager.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_holder_at_a_time() {
        let manager = Arc::new(ConnectionManager::new(FlakyFactory::new(0, false), policy(1)));
        let active = Arc::new(AtomicU32::new(0));
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let active = Arc::clone(&active);
            tasks.push(tokio::spawn(async move {
                let _guard = manager.acquire().await.unwrap();
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(manager.factory().opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_session() {
        let manager = ConnectionManager::new(FlakyFactory::new(0, false), policy(1));
        drop(manager.acquire().await.unwrap());
        manager.shutdown().await;
        assert!(!manager.is_connected());
        assert_eq!(manager.factory().closes.load(Ordering::SeqCst), 1);
    }
}
