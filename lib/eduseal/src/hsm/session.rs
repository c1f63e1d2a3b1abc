//! HSM session lifecycle

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::{HsmError, Pkcs11Driver, TokenSession};
use crate::config::HsmConfig;
use crate::error::ServiceError;

/// The process-wide authenticated token session.
///
/// Every operation takes the session lock, so at most one PKCS#11 call is in
/// flight at any time regardless of how many workers share the handle. The
/// session is never closed explicitly; it lives until process exit.
pub struct HsmSession {
    token: Mutex<Box<dyn TokenSession>>,
}

impl HsmSession {
    fn new(token: Box<dyn TokenSession>) -> Self {
        Self {
            token: Mutex::new(token),
        }
    }

    fn with_token<T>(
        &self,
        op: &str,
        f: impl FnOnce(&dyn TokenSession) -> Result<T, HsmError>,
    ) -> Result<T, HsmError> {
        let token = self
            .token
            .lock()
            .map_err(|_| HsmError::InternalError(format!("Session lock poisoned during {}", op)))?;
        f(token.as_ref())
    }

    pub fn find_private_key(&self, label: &str) -> Result<(), HsmError> {
        self.with_token("key lookup", |token| token.find_private_key(label))
    }

    pub fn certificate(&self, label: &str) -> Result<Vec<u8>, HsmError> {
        self.with_token("certificate retrieval", |token| token.certificate(label))
    }

    pub fn sign_raw(&self, key_label: &str, block: &[u8]) -> Result<Vec<u8>, HsmError> {
        self.with_token("signing", |token| token.sign_raw(key_label, block))
    }
}

/// Owns the initialization of the single [`HsmSession`].
///
/// `open` is idempotent: the first call opens and authenticates a session,
/// later calls return the same handle.
pub struct SessionManager {
    driver: Arc<dyn Pkcs11Driver>,
    config: HsmConfig,
    session: Mutex<Option<Arc<HsmSession>>>,
}

impl SessionManager {
    pub fn new(driver: Arc<dyn Pkcs11Driver>, config: HsmConfig) -> Self {
        Self {
            driver,
            config,
            session: Mutex::new(None),
        }
    }

    /// Open and authenticate the session, or return the one already open.
    ///
    /// A token that reports the user as already logged in is treated as
    /// authenticated. Every other failure is fatal for the process.
    pub fn open(&self) -> Result<Arc<HsmSession>, ServiceError> {
        let mut slot = self.session.lock().map_err(|_| {
            ServiceError::SessionInit(HsmError::InternalError(
                "Session manager lock poisoned".into(),
            ))
        })?;

        if let Some(session) = slot.as_ref() {
            debug!("pkcs11 session already open");
            return Ok(session.clone());
        }

        info!("init pkcs11 session");
        debug!("pkcs11 module: {}", self.config.module.display());
        debug!("pkcs11 slot: {:?}", self.config.slot);
        debug!("pkcs11 label: {:?}", self.config.token_label);

        let token = self
            .driver
            .open_session(&self.config)
            .map_err(ServiceError::SessionInit)?;

        match token.login(&self.config.pin) {
            Ok(()) => info!("pkcs11 user logged in"),
            Err(HsmError::AlreadyLoggedIn) => info!("pkcs11 user already logged in!"),
            Err(e) => return Err(ServiceError::SessionInit(e)),
        }

        let session = Arc::new(HsmSession::new(token));
        *slot = Some(session.clone());
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDriver, test_hsm_config};

    #[test]
    fn test_open_twice_returns_same_session() {
        let driver = Arc::new(FakeDriver::with_fixture_signer());
        let manager = SessionManager::new(driver.clone(), test_hsm_config());

        let first = manager.open().unwrap();
        let second = manager.open().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(driver.state().sessions_opened(), 1);
        assert_eq!(driver.state().logins(), 1);
    }

    #[test]
    fn test_already_logged_in_token_is_success() {
        let driver = Arc::new(FakeDriver::with_fixture_signer());
        driver.state().mark_logged_in();
        let manager = SessionManager::new(driver.clone(), test_hsm_config());

        assert!(manager.open().is_ok());
        assert_eq!(driver.state().logins(), 0);
    }

    #[test]
    fn test_second_manager_reuses_authenticated_state() {
        let driver = Arc::new(FakeDriver::with_fixture_signer());

        SessionManager::new(driver.clone(), test_hsm_config())
            .open()
            .unwrap();
        SessionManager::new(driver.clone(), test_hsm_config())
            .open()
            .unwrap();

        assert_eq!(driver.state().logins(), 1);
    }

    #[test]
    fn test_wrong_pin_is_fatal() {
        let driver = Arc::new(FakeDriver::with_fixture_signer());
        let mut config = test_hsm_config();
        config.pin = "0000".to_string();
        let manager = SessionManager::new(driver, config);

        let err = manager.open().err().unwrap();
        assert!(matches!(err, ServiceError::SessionInit(_)));
    }

    #[test]
    fn test_open_failure_is_fatal_and_retryable() {
        let driver = Arc::new(FakeDriver::with_fixture_signer());
        driver.state().fail_next_open("module not found");
        let manager = SessionManager::new(driver.clone(), test_hsm_config());

        assert!(matches!(
            manager.open().err().unwrap(),
            ServiceError::SessionInit(_)
        ));
        assert!(manager.open().is_ok());
    }
}
