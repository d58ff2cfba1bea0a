//! Local credential seam for `Negotiate` (SPNEGO/Kerberos) authentication.
//!
//! The authenticator only drives the token exchange. Producing tokens from
//! the user's credentials is delegated to a [`NegotiateProvider`], so tests can
//! script the exchange and builds without system Kerberos still link.

use super::error::AuthError;
use std::sync::Arc;

/// One client-side security context.
pub trait NegotiateContext: Send {
    /// Advance the exchange.
    ///
    /// The first call receives `None` and returns the initial token. Later
    /// calls receive the token from the proxy's challenge. `Ok(None)` means the
    /// context is complete and has nothing more to send.
    fn step(&mut self, server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, AuthError>;
}

/// Factory for security contexts.
pub trait NegotiateProvider: Send + Sync {
    /// Start a context for `service` (e.g. `HTTP@proxy.corp.example`).
    ///
    /// Fails when no usable local credentials exist.
    fn start(&self, service: &str) -> Result<Box<dyn NegotiateContext>, AuthError>;
}

/// Provider used when Negotiate support is not compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProvider;

impl NegotiateProvider for UnavailableProvider {
    fn start(&self, _service: &str) -> Result<Box<dyn NegotiateContext>, AuthError> {
        Err(AuthError::MechanismUnavailable(
            "built without the `kerberos` feature".to_string(),
        ))
    }
}

/// The provider for this build.
pub fn default_provider() -> Arc<dyn NegotiateProvider> {
    #[cfg(feature = "kerberos")]
    {
        Arc::new(kerberos::KerberosProvider)
    }
    #[cfg(not(feature = "kerberos"))]
    {
        Arc::new(UnavailableProvider)
    }
}

#[cfg(feature = "kerberos")]
pub mod kerberos {
    //! System GSSAPI credentials via `cross-krb5`.

    use super::{AuthError, NegotiateContext, NegotiateProvider};
    use cross_krb5::{ClientCtx, InitiateFlags, PendingClientCtx, Step};
    use tracing::debug;

    /// Uses the credentials in the user's ticket cache.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct KerberosProvider;

    impl NegotiateProvider for KerberosProvider {
        fn start(&self, service: &str) -> Result<Box<dyn NegotiateContext>, AuthError> {
            let (pending, token) = ClientCtx::new(InitiateFlags::empty(), None, service, None)
                .map_err(|e| AuthError::MechanismUnavailable(e.to_string()))?;

            debug!("Started Kerberos context for {}", service);
            Ok(Box::new(KerberosContext {
                initial: Some(token.to_vec()),
                pending: Some(pending),
            }))
        }
    }

    struct KerberosContext {
        initial: Option<Vec<u8>>,
        pending: Option<PendingClientCtx>,
    }

    impl NegotiateContext for KerberosContext {
        fn step(&mut self, server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, AuthError> {
            if let Some(initial) = self.initial.take() {
                return Ok(Some(initial));
            }

            let (Some(pending), Some(server_token)) = (self.pending.take(), server_token) else {
                return Ok(None);
            };

            match pending
                .step(server_token)
                .map_err(|e| AuthError::Negotiate(e.to_string()))?
            {
                Step::Finished((_ctx, token)) => Ok(token.map(|t| t.to_vec())),
                Step::Continue((pending, token)) => {
                    self.pending = Some(pending);
                    Ok(Some(token.to_vec()))
                }
            }
        }
    }
}
