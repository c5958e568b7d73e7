//! Common types used throughout FilenVault.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier of a remote file or folder (a UUID string on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    /// Create a new RemoteId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "RemoteId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a folder lives: the account root or a specific folder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FolderRef {
    /// The account's base folder.
    #[default]
    Root,
    /// A folder by identifier.
    Folder(RemoteId),
}

impl FolderRef {
    /// Parse from user input; `"root"` and `""` mean the base folder.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "" | "root" | "base" => Ok(FolderRef::Root),
            other => Ok(FolderRef::Folder(RemoteId::new(other)?)),
        }
    }

    /// Wire representation.
    pub fn as_wire(&self) -> &str {
        match self {
            FolderRef::Root => "base",
            FolderRef::Folder(id) => id.as_str(),
        }
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

/// Secret text (passwords, API keys) that zeroizes on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret. Callers must not log or persist it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

/// Account credentials. Held only while the session needs to (re)derive keys.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Account email.
    pub email: String,
    /// Plaintext password; never sent over the wire.
    pub password: SecretString,
}

impl Credentials {
    /// Create credentials.
    ///
    /// # Errors
    /// - Returns error if email or password is empty
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> crate::Result<Self> {
        let email = email.into();
        let password = SecretString::new(password);
        if email.is_empty() {
            return Err(crate::Error::InvalidInput("Email cannot be empty".to_string()));
        }
        if password.expose().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Password cannot be empty".to_string(),
            ));
        }
        Ok(Self { email, password })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_id_creation() {
        let id = RemoteId::new("b7c6a3e0-0000-4000-8000-000000000001").unwrap();
        assert_eq!(id.as_str(), "b7c6a3e0-0000-4000-8000-000000000001");
    }

    #[test]
    fn test_remote_id_empty_fails() {
        assert!(RemoteId::new("").is_err());
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(RemoteId::generate(), RemoteId::generate());
    }

    #[test]
    fn test_folder_ref_parse() {
        assert_eq!(FolderRef::parse("root").unwrap(), FolderRef::Root);
        assert_eq!(FolderRef::parse("").unwrap().as_wire(), "base");
        let folder = FolderRef::parse("abc").unwrap();
        assert_eq!(folder.as_wire(), "abc");
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = SecretString::new("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));
        let bytes = SensitiveBytes::new(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", bytes), "SensitiveBytes([REDACTED; 3 bytes])");
    }

    #[test]
    fn test_credentials_validation() {
        assert!(Credentials::new("", "pw").is_err());
        assert!(Credentials::new("a@b.c", "").is_err());
        let creds = Credentials::new("a@b.c", "correct-horse").unwrap();
        assert_eq!(creds.password.expose(), "correct-horse");
    }
}
