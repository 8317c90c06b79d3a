use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};

use crate::config::SecuritySection;

pub(crate) const ADMIN_HEADER: &str = "X-Fleet-Admin";
pub(crate) const AGENT_HEADER: &str = "X-Fleet-Agent";

/// Token checks for the admin and agent surfaces.
///
/// With neither an admin token nor its hash configured, the admin surface is
/// closed; the same goes for the agent surface without an agent token.
/// `debug` opens both.
#[derive(Clone, Debug, Default)]
pub(crate) struct AccessPolicy {
    admin_token: Option<String>,
    admin_token_sha256: Option<String>,
    agent_token: Option<String>,
    debug: bool,
}

impl AccessPolicy {
    pub fn from_config(section: &SecuritySection) -> Self {
        let non_empty = |value: &Option<String>| {
            value
                .as_ref()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            admin_token: non_empty(&section.admin_token),
            admin_token_sha256: non_empty(&section.admin_token_sha256)
                .map(|hash| hash.to_ascii_lowercase()),
            agent_token: non_empty(&section.agent_token),
            debug: section.debug,
        }
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn admin_configured(&self) -> bool {
        self.admin_token.is_some() || self.admin_token_sha256.is_some()
    }

    pub fn agent_configured(&self) -> bool {
        self.agent_token.is_some()
    }

    pub fn admin_ok(&self, headers: &HeaderMap) -> bool {
        if self.debug {
            return true;
        }
        let Some(presented) = presented_token(headers, ADMIN_HEADER) else {
            return false;
        };
        if let Some(want) = &self.admin_token_sha256 {
            let got = hex::encode(Sha256::digest(presented.as_bytes()));
            if ct_eq(want.as_bytes(), got.as_bytes()) {
                return true;
            }
        }
        self.admin_token
            .as_ref()
            .map(|token| ct_eq(token.as_bytes(), presented.as_bytes()))
            .unwrap_or(false)
    }

    pub fn agent_ok(&self, headers: &HeaderMap) -> bool {
        if self.debug {
            return true;
        }
        let (Some(token), Some(presented)) =
            (self.agent_token.as_ref(), presented_token(headers, AGENT_HEADER))
        else {
            return false;
        };
        ct_eq(token.as_bytes(), presented.as_bytes())
    }
}

fn presented_token(headers: &HeaderMap, fallback_header: &str) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .or_else(|| {
            headers
                .get(fallback_header)
                .and_then(|value| value.to_str().ok())
        })
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
