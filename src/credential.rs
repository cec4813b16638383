//! The access token used for pushes and GitHub API calls.
//!
//! A [`Credential`] only leaves this module as a per-request header value.
//! It has no `Serialize` impl and its `Debug` output is masked, so it cannot
//! end up in the state snapshot, a log line or a persisted remote URL.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::errors::{WorkerError, WorkerResult};

pub const REDACTED: &str = "<REDACTED>";

#[derive(Clone)]
pub struct Credential {
    secret: Arc<str>,
}

impl Credential {
    pub fn new(secret: &str) -> WorkerResult<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(WorkerError::Configuration(
                "access token is empty".to_string(),
            ));
        }
        Ok(Self {
            secret: Arc::from(secret),
        })
    }

    /// First non-empty value wins.
    pub fn from_sources(primary: Option<&str>, alternate: Option<&str>) -> WorkerResult<Self> {
        [primary, alternate]
            .into_iter()
            .flatten()
            .find(|value| !value.trim().is_empty())
            .map(Self::new)
            .unwrap_or_else(|| {
                Err(WorkerError::Configuration(
                    "GITHUB_TOKEN (or ENGINEER_PAT_KEY) is required".to_string(),
                ))
            })
    }

    /// `Authorization` value for git over smart HTTP.
    pub fn auth_header(&self) -> String {
        format!("Basic {}", self.basic_blob())
    }

    /// `Authorization` value for the GitHub REST and GraphQL APIs.
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.secret)
    }

    fn basic_blob(&self) -> String {
        STANDARD.encode(format!("x-access-token:{}", self.secret))
    }

    /// Replace every occurrence of the secret, or its encoded header form, in
    /// `text`.
    pub fn redact(&self, text: &str) -> String {
        text.replace(self.basic_blob().as_str(), REDACTED)
            .replace(&*self.secret, REDACTED)
    }

    #[cfg(test)]
    pub(crate) fn expose(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Redact with an optional credential. Used where the worker may run without
/// one, such as local-only git operations in tests.
pub fn scrub(credential: Option<&Credential>, text: &str) -> String {
    match credential {
        Some(credential) => credential.redact(text),
        None => text.to_string(),
    }
}
