//! Parsing of `Proxy-Authenticate` challenges.
//!
//! A proxy may send several headers, or pack several challenges into one
//! comma-separated header. Each challenge is a scheme followed by either a
//! token68 (`Negotiate YIIB...`) or auth-params (`Basic realm="corp"`).

use hyper::HeaderMap;
use hyper::header::PROXY_AUTHENTICATE;
use std::fmt;

/// One challenge offered by the upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Authentication scheme as sent by the proxy.
    pub scheme: String,
    /// Opaque token following the scheme, if any.
    pub token: Option<String>,
    /// `name=value` parameters, quotes removed.
    pub params: Vec<(String, String)>,
}

impl Challenge {
    fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            token: None,
            params: Vec::new(),
        }
    }

    /// Case-insensitive scheme comparison.
    pub fn is(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
    }

    /// Look up an auth-param by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scheme)
    }
}

/// Collect every challenge from the `Proxy-Authenticate` headers.
pub fn from_headers(headers: &HeaderMap) -> Vec<Challenge> {
    parse(
        headers
            .get_all(PROXY_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    )
}

/// Parse raw header values into challenges.
pub fn parse<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<Challenge> {
    let mut challenges: Vec<Challenge> = Vec::new();

    for value in values {
        for part in split_outside_quotes(value) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some((name, raw)) = as_auth_param(part)
                && let Some(current) = challenges.last_mut()
            {
                current.params.push((name.to_string(), unquote(raw)));
                continue;
            }

            let (scheme, rest) = match part.split_once(char::is_whitespace) {
                Some((scheme, rest)) => (scheme, rest.trim()),
                None => (part, ""),
            };

            let mut challenge = Challenge::new(scheme);
            if !rest.is_empty() {
                match as_auth_param(rest) {
                    Some((name, raw)) => challenge.params.push((name.to_string(), unquote(raw))),
                    None => challenge.token = Some(rest.to_string()),
                }
            }
            challenges.push(challenge);
        }
    }

    challenges
}

/// Render the offered schemes for error messages.
pub fn describe(challenges: &[Challenge]) -> String {
    if challenges.is_empty() {
        return "none".to_string();
    }
    challenges
        .iter()
        .map(|c| c.scheme.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `name=value` with no whitespace in the name. A token68 ending in `=`
/// padding has no value after the sign and is not a parameter.
fn as_auth_param(part: &str) -> Option<(&str, &str)> {
    let (name, value) = part.split_once('=')?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || name.contains(char::is_whitespace) || value.is_empty() {
        return None;
    }
    if value.starts_with('=') {
        return None;
    }
    Some((name, value))
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

fn split_outside_quotes(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}
