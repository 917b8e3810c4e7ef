use std::error::Error;
use std::fmt;

/// Describes failures when reading or writing the identity store.
///
/// Recoverable errors indicate that the credential backend was
/// temporarily unavailable (for example when the keychain service is
/// locked or inaccessible). Permanent errors surface the underlying
/// cause directly so callers can report them to the user. Corrupt
/// values were read successfully but cannot be decoded.
#[derive(Debug)]
pub enum StoreError {
    Recoverable(keyring::Error),
    Permanent(keyring::Error),
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true when the error represents a temporary outage of the
    /// platform keyring backend.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Recoverable(_))
    }
}

impl From<keyring::Error> for StoreError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                StoreError::Recoverable(err)
            }
            other => StoreError::Permanent(other),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Recoverable(err) => write!(f, "keyring temporarily unavailable: {err}"),
            StoreError::Permanent(err) => write!(f, "{err}"),
            StoreError::Corrupt { key, reason } => {
                write!(f, "stored value for '{key}' is unreadable: {reason}")
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Recoverable(err) | StoreError::Permanent(err) => Some(err),
            StoreError::Corrupt { .. } => None,
        }
    }
}
