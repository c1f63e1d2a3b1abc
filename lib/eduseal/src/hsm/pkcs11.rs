//! PKCS#11 driver backed by cryptoki

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CryptokiError, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use tracing::debug;

use super::{HsmError, Pkcs11Driver, TokenSession};
use crate::config::HsmConfig;

/// Loads the configured module through cryptoki.
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptokiDriver;

impl Pkcs11Driver for CryptokiDriver {
    fn open_session(&self, config: &HsmConfig) -> Result<Box<dyn TokenSession>, HsmError> {
        let pkcs11 = Pkcs11::new(&config.module)?;
        match pkcs11.initialize(CInitializeArgs::OsThreads) {
            Ok(()) | Err(CryptokiError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
            Err(e) => return Err(e.into()),
        }

        let slot = select_slot(&pkcs11, config.slot, config.token_label.as_deref())?;
        debug!("Opening read-write session on slot {}", slot);
        let session = pkcs11.open_rw_session(slot)?;

        Ok(Box::new(CryptokiSession { session }))
    }
}

fn token_label(pkcs11: &Pkcs11, slot: Slot) -> Result<String, HsmError> {
    Ok(pkcs11.get_token_info(slot)?.label().trim().to_string())
}

fn select_slot(
    pkcs11: &Pkcs11,
    index: Option<usize>,
    label: Option<&str>,
) -> Result<Slot, HsmError> {
    let slots = pkcs11.get_slots_with_token()?;

    match (index, label) {
        (Some(index), label) => {
            let slot = slots
                .get(index)
                .copied()
                .ok_or(HsmError::NoSlotAvailable)?;
            if let Some(label) = label
                && token_label(pkcs11, slot)? != label
            {
                return Err(HsmError::TokenNotFound(format!(
                    "slot {} does not hold token '{}'",
                    index, label
                )));
            }
            Ok(slot)
        }
        (None, Some(label)) => {
            for slot in slots {
                if token_label(pkcs11, slot)? == label {
                    return Ok(slot);
                }
            }
            Err(HsmError::TokenNotFound(label.to_string()))
        }
        (None, None) => slots.first().copied().ok_or(HsmError::NoSlotAvailable),
    }
}

/// The session keeps its own handle on the loaded module.
struct CryptokiSession {
    session: Session,
}

impl CryptokiSession {
    fn find_object(&self, label: &str, class: ObjectClass) -> Result<Option<ObjectHandle>, HsmError> {
        let template = vec![
            Attribute::Class(class),
            Attribute::Label(label.as_bytes().to_vec()),
        ];
        Ok(self.session.find_objects(&template)?.into_iter().next())
    }

    fn private_key(&self, label: &str) -> Result<ObjectHandle, HsmError> {
        self.find_object(label, ObjectClass::PRIVATE_KEY)?
            .ok_or_else(|| HsmError::KeyNotFound(label.to_string()))
    }
}

impl TokenSession for CryptokiSession {
    fn login(&self, pin: &str) -> Result<(), HsmError> {
        match self
            .session
            .login(UserType::User, Some(&AuthPin::new(pin.into())))
        {
            Ok(()) => Ok(()),
            Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {
                Err(HsmError::AlreadyLoggedIn)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_private_key(&self, label: &str) -> Result<(), HsmError> {
        self.private_key(label).map(|_| ())
    }

    fn certificate(&self, label: &str) -> Result<Vec<u8>, HsmError> {
        let handle = self
            .find_object(label, ObjectClass::CERTIFICATE)?
            .ok_or_else(|| HsmError::CertificateNotFound(label.to_string()))?;

        let attrs = self
            .session
            .get_attributes(handle, &[AttributeType::Value])?;

        attrs
            .into_iter()
            .find_map(|attr| match attr {
                Attribute::Value(bytes) => Some(bytes),
                _ => None,
            })
            .ok_or_else(|| HsmError::CertificateNotFound(label.to_string()))
    }

    fn sign_raw(&self, key_label: &str, block: &[u8]) -> Result<Vec<u8>, HsmError> {
        let key = self.private_key(key_label)?;
        self.session
            .sign(&Mechanism::RsaX509, key, block)
            .map_err(|e| HsmError::SigningFailed(e.to_string()))
    }
}
