use std::error::Error;
use std::fmt;

use tracing::debug;

const KEYRING_SERVICE: &str = "coachai";
const KEYRING_USER: &str = "openai";

/// Environment variable consulted before the keyring.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Describes failures when attempting to access the system keyring.
///
/// Recoverable errors indicate that the credential backend was
/// temporarily unavailable (for example when the keychain service is
/// locked or inaccessible). Permanent errors surface the underlying
/// cause directly so callers can report them to the user.
#[derive(Debug)]
pub enum KeyringAccessError {
    Recoverable(keyring::Error),
    Permanent(keyring::Error),
}

impl KeyringAccessError {
    fn inner(&self) -> &keyring::Error {
        match self {
            KeyringAccessError::Recoverable(err) | KeyringAccessError::Permanent(err) => err,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, KeyringAccessError::Recoverable(_))
    }
}

impl From<keyring::Error> for KeyringAccessError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                KeyringAccessError::Recoverable(err)
            }
            other => KeyringAccessError::Permanent(other),
        }
    }
}

impl fmt::Display for KeyringAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner())
    }
}

impl Error for KeyringAccessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.inner())
    }
}

/// Pick the API key from the environment value if set, else from the
/// keyring lookup.
fn choose_api_key<F>(
    env_value: Option<String>,
    keyring_lookup: F,
) -> Result<Option<String>, KeyringAccessError>
where
    F: FnOnce() -> Result<Option<String>, KeyringAccessError>,
{
    match env_value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(key) => {
            debug!("Using API key from {API_KEY_ENV}");
            Ok(Some(key))
        }
        None => keyring_lookup(),
    }
}

fn keyring_api_key() -> Result<Option<String>, KeyringAccessError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Resolve the API key: `OPENAI_API_KEY`, then the system keyring.
pub fn resolve_api_key() -> Result<Option<String>, KeyringAccessError> {
    choose_api_key(std::env::var(API_KEY_ENV).ok(), keyring_api_key)
}

pub fn store_api_key(key: &str) -> Result<(), KeyringAccessError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
    entry.set_password(key.trim())?;
    Ok(())
}
