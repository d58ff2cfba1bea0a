//! Basic credentials taken from the upstream proxy URL.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use zeroize::Zeroizing;

/// Username and password for `Basic` proxy authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    /// Username, percent-decoded.
    pub username: String,
    /// Password, percent-decoded and wiped on drop.
    pub password: Zeroizing<String>,
}

impl BasicCredentials {
    /// Build from already-decoded parts.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// `Basic base64(user:password)`.
    pub fn header_value(&self) -> Zeroizing<String> {
        let plain = Zeroizing::new(format!("{}:{}", self.username, self.password.as_str()));
        Zeroizing::new(format!("Basic {}", STANDARD.encode(plain.as_bytes())))
    }
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
