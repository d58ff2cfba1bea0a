//! Per-tunnel challenge/response against the upstream proxy.
//!
//! An [`UpstreamAuthenticator`] is built once when the proxy starts. Each
//! CONNECT through the upstream proxy gets a fresh [`AuthSession`] that is
//! fed every `407` challenge and answers with the next `Proxy-Authorization`
//! value, until the proxy accepts or the session gives up.

use super::basic::BasicCredentials;
use super::challenge::{self, Challenge};
use super::error::AuthError;
use super::mechanism::AuthMechanism;
use super::negotiate::{NegotiateContext, NegotiateProvider};
use crate::proxy::upstream::UpstreamProxy;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hyper::header::HeaderValue;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Maximum number of `Proxy-Authorization` responses per session.
pub const MAX_AUTH_ROUNDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Negotiate,
    Basic,
}

impl Scheme {
    fn name(self) -> &'static str {
        match self {
            Scheme::Negotiate => "Negotiate",
            Scheme::Basic => "Basic",
        }
    }
}

enum Active {
    Negotiate(Box<dyn NegotiateContext>),
    Basic,
}

/// Builds authentication sessions for one upstream proxy.
pub struct UpstreamAuthenticator {
    mechanism: AuthMechanism,
    service: String,
    basic: Option<Arc<BasicCredentials>>,
    provider: Arc<dyn NegotiateProvider>,
}

impl UpstreamAuthenticator {
    /// Create the authenticator for `proxy`.
    ///
    /// The Negotiate service principal is `HTTP@<proxy host>`. Basic
    /// credentials come from the proxy URL and are only used by
    /// [`AuthMechanism::Any`].
    pub fn new(
        mechanism: AuthMechanism,
        proxy: &UpstreamProxy,
        provider: Arc<dyn NegotiateProvider>,
    ) -> Self {
        Self {
            mechanism,
            service: format!("HTTP@{}", proxy.host),
            basic: proxy.credentials.clone().map(Arc::new),
            provider,
        }
    }

    /// The configured mechanism.
    pub fn mechanism(&self) -> AuthMechanism {
        self.mechanism
    }

    /// Start a session for one tunnel.
    pub fn session(&self) -> AuthSession {
        AuthSession {
            mechanism: self.mechanism,
            service: self.service.clone(),
            basic: self.basic.clone(),
            provider: self.provider.clone(),
            rounds: 0,
            active: None,
            last: None,
            rejected: Vec::new(),
        }
    }
}

impl fmt::Debug for UpstreamAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamAuthenticator")
            .field("mechanism", &self.mechanism)
            .field("service", &self.service)
            .field("basic", &self.basic.is_some())
            .finish()
    }
}

/// State of one authentication exchange. Never reused across tunnels.
pub struct AuthSession {
    mechanism: AuthMechanism,
    service: String,
    basic: Option<Arc<BasicCredentials>>,
    provider: Arc<dyn NegotiateProvider>,
    rounds: usize,
    active: Option<Active>,
    last: Option<Scheme>,
    rejected: Vec<Scheme>,
}

impl AuthSession {
    /// Answer a `407` carrying `challenges`.
    ///
    /// Returns the header value to attach to the retried CONNECT.
    pub fn respond(&mut self, challenges: &[Challenge]) -> Result<HeaderValue, AuthError> {
        if self.mechanism == AuthMechanism::None {
            return Err(AuthError::NotPermitted);
        }
        if self.rounds >= MAX_AUTH_ROUNDS {
            return Err(AuthError::RoundsExhausted {
                rounds: self.rounds,
            });
        }

        if let Some(active) = self.active.take() {
            match active {
                Active::Negotiate(mut ctx) => {
                    let server_token = challenges
                        .iter()
                        .find(|c| c.is(Scheme::Negotiate.name()))
                        .and_then(|c| c.token.as_deref());

                    if let Some(encoded) = server_token {
                        let decoded = STANDARD
                            .decode(encoded.trim())
                            .map_err(|e| AuthError::MalformedChallenge(e.to_string()))?;
                        if let Some(token) = ctx.step(Some(&decoded))? {
                            self.active = Some(Active::Negotiate(ctx));
                            return self.emit(Scheme::Negotiate, &encode_token(&token));
                        }
                    }
                    debug!("Upstream proxy rejected Negotiate credentials");
                    self.rejected.push(Scheme::Negotiate);
                }
                Active::Basic => {
                    debug!("Upstream proxy rejected Basic credentials");
                    self.rejected.push(Scheme::Basic);
                }
            }
        }

        for scheme in self.candidates() {
            if self.rejected.contains(scheme) || !challenges.iter().any(|c| c.is(scheme.name())) {
                continue;
            }

            match scheme {
                Scheme::Negotiate => {
                    let started = self
                        .provider
                        .start(&self.service)
                        .and_then(|mut ctx| ctx.step(None).map(|token| (ctx, token)));

                    match started {
                        Ok((ctx, Some(token))) => {
                            self.active = Some(Active::Negotiate(ctx));
                            return self.emit(Scheme::Negotiate, &encode_token(&token));
                        }
                        Ok((_, None)) => self.rejected.push(Scheme::Negotiate),
                        Err(e) if self.mechanism == AuthMechanism::Any => {
                            debug!("Negotiate not usable, trying next scheme: {}", e);
                            self.rejected.push(Scheme::Negotiate);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Scheme::Basic => {
                    if let Some(creds) = self.basic.clone() {
                        self.active = Some(Active::Basic);
                        let value = creds.header_value();
                        return self.emit(Scheme::Basic, &value);
                    }
                }
            }
        }

        let offered = challenge::describe(challenges);
        if self.rounds == 0 {
            Err(AuthError::NoSupportedScheme { offered })
        } else {
            Err(AuthError::Rejected { offered })
        }
    }

    /// Number of responses produced so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Scheme of the most recent response, if any.
    ///
    /// Still reported after the proxy rejected that response.
    pub fn scheme(&self) -> Option<&'static str> {
        self.last.map(Scheme::name)
    }

    fn candidates(&self) -> &'static [Scheme] {
        match self.mechanism {
            AuthMechanism::None => &[],
            AuthMechanism::Negotiate => &[Scheme::Negotiate],
            AuthMechanism::Any => &[Scheme::Negotiate, Scheme::Basic],
        }
    }

    fn emit(&mut self, scheme: Scheme, value: &str) -> Result<HeaderValue, AuthError> {
        self.rounds += 1;
        self.last = Some(scheme);
        debug!(
            "Answering upstream challenge with {} (round {})",
            scheme.name(),
            self.rounds
        );
        let mut header = HeaderValue::from_str(value)?;
        header.set_sensitive(true);
        Ok(header)
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("mechanism", &self.mechanism)
            .field("rounds", &self.rounds)
            .field("scheme", &self.scheme())
            .field("rejected", &self.rejected)
            .finish()
    }
}

fn encode_token(token: &[u8]) -> String {
    format!("Negotiate {}", STANDARD.encode(token))
}
