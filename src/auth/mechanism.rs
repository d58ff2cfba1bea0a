//! Authentication mechanism selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which upstream proxy authentication the wrapper may perform.
///
/// Selected once when the proxy starts; every tunnel session follows it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum AuthMechanism {
    /// Never authenticate. A `407` fails the tunnel.
    None,
    /// Negotiate (SPNEGO/Kerberos) only.
    Negotiate,
    /// Negotiate first, then Basic, whichever the proxy accepts.
    #[default]
    Any,
}

impl AuthMechanism {
    /// Canonical lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::None => "none",
            AuthMechanism::Negotiate => "negotiate",
            AuthMechanism::Any => "any",
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "noauth" => Ok(AuthMechanism::None),
            "negotiate" => Ok(AuthMechanism::Negotiate),
            "any" | "anyauth" => Ok(AuthMechanism::Any),
            other => Err(format!(
                "unknown authentication mechanism {:?} (expected none, negotiate or any)",
                other
            )),
        }
    }
}
