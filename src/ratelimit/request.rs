//! Admission request types.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::policy::EntityType;
use crate::error::{Result, TollgateError};

/// The request key a policy is matched against: method plus path,
/// written as `"POST /api/v1/auth/login"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    method: String,
    path: String,
}

impl Endpoint {
    /// Create an endpoint from a method and a path. The method is uppercased.
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
        }
    }

    /// Parse the `"METHOD /path"` form.
    pub fn parse(key: &str) -> Result<Self> {
        let (method, path) = key.trim().split_once(' ').ok_or_else(|| {
            TollgateError::InvalidRequest(format!(
                "endpoint '{}' must be of the form 'METHOD /path'",
                key
            ))
        })?;
        let path = path.trim();

        if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(TollgateError::InvalidRequest(format!(
                "endpoint '{}' has an invalid method",
                key
            )));
        }
        if !path.starts_with('/') {
            return Err(TollgateError::InvalidRequest(format!(
                "endpoint '{}' path must start with '/'",
                key
            )));
        }

        Ok(Self::new(method, path))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The string form stored in counters and logs.
    pub fn as_key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = TollgateError;

    fn try_from(value: String) -> Result<Self> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.as_key()
    }
}

/// The principal a request is charged to, resolved upstream of the gate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub entity_type: EntityType,
    pub entity_identifier: String,
    #[serde(default)]
    pub is_authenticated: bool,
}

impl Principal {
    pub fn ip(addr: impl fmt::Display) -> Self {
        Self {
            entity_type: EntityType::Ip,
            entity_identifier: addr.to_string(),
            is_authenticated: false,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            entity_type: EntityType::User,
            entity_identifier: id.into(),
            is_authenticated: true,
        }
    }

    pub fn api_key(id: impl Into<String>) -> Self {
        Self {
            entity_type: EntityType::ApiKey,
            entity_identifier: id.into(),
            is_authenticated: true,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_identifier)
    }
}

/// Everything the gate needs to decide on one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub entity_type: EntityType,
    pub entity_identifier: String,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub is_authenticated: bool,
}

impl AdmissionRequest {
    pub fn new(principal: &Principal, endpoint: Endpoint) -> Self {
        Self {
            entity_type: principal.entity_type,
            entity_identifier: principal.entity_identifier.clone(),
            endpoint,
            is_authenticated: principal.is_authenticated,
        }
    }

    /// The principal this request is charged to.
    pub fn principal(&self) -> Principal {
        Principal {
            entity_type: self.entity_type,
            entity_identifier: self.entity_identifier.clone(),
            is_authenticated: self.is_authenticated,
        }
    }
}
