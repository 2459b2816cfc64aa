//! Authentication & Authorization
//!
//! Bearer tokens with role-based permissions. Tokens are configured at
//! process start (`AUTH_TOKENS=name=token=perm;perm,...`); permission
//! checks run before any component call, and denials emit
//! `access_denied` ledger events at the API layer.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Grantable permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    ReadSessions,
    ReadFeatures,
    WriteNeuralData,
    ExecuteAnalysis,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadSessions => "read:sessions",
            Permission::ReadFeatures => "read:features",
            Permission::WriteNeuralData => "write:neural_data",
            Permission::ExecuteAnalysis => "execute:analysis",
            Permission::Admin => "admin:*",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read:sessions" => Some(Permission::ReadSessions),
            "read:features" => Some(Permission::ReadFeatures),
            "write:neural_data" => Some(Permission::WriteNeuralData),
            "execute:analysis" => Some(Permission::ExecuteAnalysis),
            "admin:*" => Some(Permission::Admin),
            _ => None,
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub permissions: HashSet<Permission>,
}

impl Principal {
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::Admin)
            || self.permissions.contains(&permission)
    }
}

/// Token registry assembled once at startup
#[derive(Debug, Clone, Default)]
pub struct AuthRegistry {
    tokens: HashMap<String, Principal>,
    allow_anonymous: bool,
}

impl AuthRegistry {
    /// Parse `AUTH_TOKENS` entries of the form
    /// `name=token=perm;perm[,name=token=perms...]`.
    pub fn from_spec(spec: &str, allow_anonymous: bool) -> Result<Self> {
        let mut tokens = HashMap::new();
        for entry in spec.split(',').filter(|e| !e.trim().is_empty()) {
            let mut parts = entry.trim().splitn(3, '=');
            let (name, token, perms) = match (parts.next(), parts.next(), parts.next()) {
                (Some(n), Some(t), Some(p)) => (n, t, p),
                _ => {
                    return Err(EngineError::configuration(format!(
                        "malformed AUTH_TOKENS entry: {entry}"
                    )))
                }
            };
            let mut permissions = HashSet::new();
            for perm in perms.split(';').filter(|p| !p.is_empty()) {
                let parsed = Permission::parse(perm).ok_or_else(|| {
                    EngineError::configuration(format!("unknown permission {perm}"))
                })?;
                permissions.insert(parsed);
            }
            tokens.insert(
                token.to_string(),
                Principal {
                    name: name.to_string(),
                    permissions,
                },
            );
        }
        Ok(Self {
            tokens,
            allow_anonymous,
        })
    }

    pub fn from_env() -> Result<Self> {
        let allow_anonymous = std::env::var("AUTH_ALLOW_ANONYMOUS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        match std::env::var("AUTH_TOKENS") {
            Ok(spec) => Self::from_spec(&spec, allow_anonymous),
            Err(_) if allow_anonymous => Ok(Self {
                tokens: HashMap::new(),
                allow_anonymous: true,
            }),
            // Fail closed: a deployment without tokens must opt into
            // anonymous mode explicitly
            Err(_) => Err(EngineError::configuration(
                "AUTH_TOKENS unset and AUTH_ALLOW_ANONYMOUS not enabled",
            )),
        }
    }

    /// Resolve an `Authorization` header value to a principal
    pub fn authenticate(&self, header: Option<&str>) -> Option<Principal> {
        match header {
            Some(value) => {
                let token = value.strip_prefix("Bearer ")?;
                self.tokens.get(token).cloned()
            }
            None if self.allow_anonymous => Some(Principal {
                name: "anonymous".to_string(),
                permissions: HashSet::from([Permission::Admin]),
            }),
            None => None,
        }
    }
}
