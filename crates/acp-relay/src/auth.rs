pub const DEFAULT_TOKEN_PREFIX: &str = "agt_";
pub const LICENSE_ACTIVE: &str = "active";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow { license_status: String },
    Deny { reason: String },
}

/// Decides whether a presented agent credential may open a session.
pub trait Authenticator: Send + Sync {
    fn validate(&self, credential: Option<&str>) -> AuthDecision;
}

/// Format-only check: the credential must be present and carry the issuer
/// prefix. This is a placeholder policy and not a security boundary; plug a
/// store-backed [`Authenticator`] in its place for real deployments.
#[derive(Debug, Clone)]
pub struct PrefixAuthenticator {
    prefix: String,
}

impl PrefixAuthenticator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for PrefixAuthenticator {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_PREFIX)
    }
}

impl Authenticator for PrefixAuthenticator {
    fn validate(&self, credential: Option<&str>) -> AuthDecision {
        let Some(credential) = credential.map(str::trim).filter(|value| !value.is_empty()) else {
            return AuthDecision::Deny {
                reason: "missing credential".to_string(),
            };
        };
        if !credential.starts_with(&self.prefix) || credential.len() == self.prefix.len() {
            return AuthDecision::Deny {
                reason: "malformed credential".to_string(),
            };
        }
        AuthDecision::Allow {
            license_status: LICENSE_ACTIVE.to_string(),
        }
    }
}
