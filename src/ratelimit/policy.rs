//! Rate limit policies and endpoint pattern matching.
//!
//! Policies are written as YAML records and validated eagerly: a definition
//! with a non-positive limit or window, or a malformed pattern, is rejected
//! here and never reaches the resolver.
//!
//! ```yaml
//! policies:
//!   - endpoint_pattern: "POST /api/v1/auth/login"
//!     entity_type: ip
//!     requests_limit: 5
//!     window_size_seconds: 60
//!     description: Login brute-force protection
//!     failure_mode: fail_closed
//!   - endpoint_pattern: "/api/users/*"
//!     entity_type: user
//!     requests_limit: 600
//!     window_size_seconds: 60
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use super::request::Endpoint;
use crate::error::{Result, TollgateError};

/// Suffix marking a prefix (wildcard) pattern.
pub const WILDCARD: char = '*';

/// The kind of principal a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Ip,
    User,
    ApiKey,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Ip => "ip",
            EntityType::User => "user",
            EntityType::ApiKey => "api_key",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ip" => Ok(EntityType::Ip),
            "user" => Ok(EntityType::User),
            "api_key" => Ok(EntityType::ApiKey),
            other => Err(TollgateError::InvalidPolicy(format!(
                "unknown entity type '{}'",
                other
            ))),
        }
    }
}

/// Outcome applied when the counter store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Allow the request and record an audit event
    #[default]
    FailOpen,
    /// Deny the request with 429
    FailClosed,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureMode::FailOpen => f.write_str("fail_open"),
            FailureMode::FailClosed => f.write_str("fail_closed"),
        }
    }
}

/// How the path part of a pattern is compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatch {
    /// The request path must equal this string
    Exact(String),
    /// The request path must start with this literal prefix
    Prefix(String),
}

/// How closely a pattern matched a request. Larger is more specific.
///
/// Field order gives the precedence: any exact match beats any prefix match,
/// then the longer literal wins, then a method-qualified pattern wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    exact: bool,
    literal_len: usize,
    method_qualified: bool,
}

impl Specificity {
    pub fn is_exact(&self) -> bool {
        self.exact
    }

    pub fn literal_len(&self) -> usize {
        self.literal_len
    }
}

/// A parsed `endpoint_pattern`: an optional HTTP method, then a path that
/// may end in `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPattern {
    raw: String,
    method: Option<String>,
    path: PathMatch,
}

impl EndpointPattern {
    /// Parse and validate a pattern.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TollgateError::InvalidPolicy(
                "endpoint_pattern must not be empty".to_string(),
            ));
        }

        let (method, path) = match trimmed.split_once(char::is_whitespace) {
            Some((method, path)) => {
                if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Err(TollgateError::InvalidPolicy(format!(
                        "invalid method '{}' in pattern '{}'",
                        method, raw
                    )));
                }
                (Some(method.to_ascii_uppercase()), path.trim())
            }
            None => (None, trimmed),
        };

        if path != "*" && !path.starts_with('/') {
            return Err(TollgateError::InvalidPolicy(format!(
                "path in pattern '{}' must start with '/'",
                raw
            )));
        }
        if path.chars().any(char::is_whitespace) {
            return Err(TollgateError::InvalidPolicy(format!(
                "pattern '{}' contains whitespace inside the path",
                raw
            )));
        }

        let (literal, is_prefix) = match path.strip_suffix(WILDCARD) {
            Some(prefix) => (prefix, true),
            None => (path, false),
        };
        if literal.contains(WILDCARD) {
            return Err(TollgateError::InvalidPolicy(format!(
                "wildcard may only appear at the end of pattern '{}'",
                raw
            )));
        }
        let path = if is_prefix {
            PathMatch::Prefix(literal.to_string())
        } else {
            PathMatch::Exact(literal.to_string())
        };

        let canonical = match (&method, &path) {
            (Some(m), PathMatch::Exact(p)) => format!("{} {}", m, p),
            (Some(m), PathMatch::Prefix(p)) => format!("{} {}{}", m, p, WILDCARD),
            (None, PathMatch::Exact(p)) => p.clone(),
            (None, PathMatch::Prefix(p)) => format!("{}{}", p, WILDCARD),
        };

        Ok(Self {
            raw: canonical,
            method,
            path,
        })
    }

    /// The canonical text form of this pattern.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn path(&self) -> &PathMatch {
        &self.path
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.path, PathMatch::Prefix(_))
    }

    /// Match against a concrete endpoint, returning how specific the match is.
    pub fn matches(&self, endpoint: &Endpoint) -> Option<Specificity> {
        if let Some(method) = &self.method {
            if !method.eq_ignore_ascii_case(endpoint.method()) {
                return None;
            }
        }

        let method_qualified = self.method.is_some();
        match &self.path {
            PathMatch::Exact(path) if path == endpoint.path() => Some(Specificity {
                exact: true,
                literal_len: path.len(),
                method_qualified,
            }),
            PathMatch::Prefix(prefix) if endpoint.path().starts_with(prefix.as_str()) => {
                Some(Specificity {
                    exact: false,
                    literal_len: prefix.len(),
                    method_qualified,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for EndpointPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A policy as written by an administrator, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub endpoint_pattern: String,
    pub entity_type: EntityType,
    pub requests_limit: i64,
    pub window_size_seconds: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub description: String,
    /// Overrides the global fallback for this policy
    #[serde(default)]
    pub failure_mode: Option<FailureMode>,
}

fn default_active() -> bool {
    true
}

impl PolicyDefinition {
    /// Create an active definition with no description or override.
    pub fn new(
        entity_type: EntityType,
        endpoint_pattern: &str,
        requests_limit: i64,
        window_size_seconds: i64,
    ) -> Self {
        Self {
            endpoint_pattern: endpoint_pattern.to_string(),
            entity_type,
            requests_limit,
            window_size_seconds,
            is_active: true,
            description: String::new(),
            failure_mode: None,
        }
    }

    /// Validate this definition into a [`Policy`].
    pub fn validate(&self) -> Result<Policy> {
        if self.requests_limit <= 0 {
            return Err(TollgateError::InvalidPolicy(format!(
                "requests_limit must be greater than 0 for '{}', got {}",
                self.endpoint_pattern, self.requests_limit
            )));
        }
        if self.window_size_seconds <= 0 {
            return Err(TollgateError::InvalidPolicy(format!(
                "window_size_seconds must be greater than 0 for '{}', got {}",
                self.endpoint_pattern, self.window_size_seconds
            )));
        }

        Ok(Policy {
            endpoint_pattern: EndpointPattern::parse(&self.endpoint_pattern)?,
            entity_type: self.entity_type,
            requests_limit: self.requests_limit as u64,
            window_size_seconds: self.window_size_seconds as u64,
            is_active: self.is_active,
            description: self.description.clone(),
            failure_mode: self.failure_mode,
        })
    }
}

/// A validated rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub endpoint_pattern: EndpointPattern,
    pub entity_type: EntityType,
    pub requests_limit: u64,
    pub window_size_seconds: u64,
    pub is_active: bool,
    pub description: String,
    pub failure_mode: Option<FailureMode>,
}

impl Policy {
    /// Validate and build an active policy in one step.
    pub fn try_new(
        entity_type: EntityType,
        endpoint_pattern: &str,
        requests_limit: i64,
        window_size_seconds: i64,
    ) -> Result<Self> {
        PolicyDefinition::new(entity_type, endpoint_pattern, requests_limit, window_size_seconds)
            .validate()
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = Some(mode);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Ordering used to break ties between equally specific matches:
    /// the stricter policy sorts first.
    pub(crate) fn tie_break(&self, other: &Policy) -> Ordering {
        self.requests_limit
            .cmp(&other.requests_limit)
            .then(self.window_size_seconds.cmp(&other.window_size_seconds))
            .then(self.endpoint_pattern.as_str().cmp(other.endpoint_pattern.as_str()))
            .then(failure_rank(self.failure_mode).cmp(&failure_rank(other.failure_mode)))
            .then_with(|| self.description.cmp(&other.description))
    }
}

fn failure_rank(mode: Option<FailureMode>) -> u8 {
    match mode {
        Some(FailureMode::FailClosed) => 0,
        None => 1,
        Some(FailureMode::FailOpen) => 2,
    }
}

/// A YAML document holding a list of policy definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
}

impl PolicyFile {
    /// Parse and validate policies from a YAML string.
    ///
    /// The whole document is rejected if any single definition is invalid.
    pub fn parse(yaml: &str) -> Result<Vec<Policy>> {
        let file: PolicyFile = serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::InvalidPolicy(format!("Failed to parse policy file: {}", e))
        })?;

        file.policies.iter().map(PolicyDefinition::validate).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(key: &str) -> Endpoint {
        Endpoint::parse(key).unwrap()
    }

    #[test]
    fn test_parse_exact_pattern() {
        let pattern = EndpointPattern::parse("POST /api/v1/auth/login").unwrap();
        assert_eq!(pattern.method(), Some("POST"));
        assert_eq!(pattern.path(), &PathMatch::Exact("/api/v1/auth/login".to_string()));
        assert!(!pattern.is_wildcard());
        assert_eq!(pattern.as_str(), "POST /api/v1/auth/login");
    }

    #[test]
    fn test_parse_wildcard_pattern() {
        let pattern = EndpointPattern::parse("/api/users/*").unwrap();
        assert_eq!(pattern.method(), None);
        assert_eq!(pattern.path(), &PathMatch::Prefix("/api/users/".to_string()));
        assert!(pattern.is_wildcard());
    }

    #[test]
    fn test_parse_normalizes_method_case() {
        let pattern = EndpointPattern::parse("get /health").unwrap();
        assert_eq!(pattern.method(), Some("GET"));
        assert_eq!(pattern.as_str(), "GET /health");
    }

    #[test]
    fn test_parse_match_all() {
        let pattern = EndpointPattern::parse("*").unwrap();
        assert_eq!(pattern.path(), &PathMatch::Prefix(String::new()));
        assert!(pattern.matches(&endpoint("DELETE /anything")).is_some());
    }

    #[test]
    fn test_parse_rejects_malformed_patterns() {
        for raw in ["", "   ", "api/users", "/api/*/profile", "P0ST /x", "GET /a b"] {
            assert!(
                matches!(EndpointPattern::parse(raw), Err(TollgateError::InvalidPolicy(_))),
                "pattern {:?} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_exact_match() {
        let pattern = EndpointPattern::parse("/api/users/profile").unwrap();
        let specificity = pattern.matches(&endpoint("GET /api/users/profile")).unwrap();
        assert!(specificity.is_exact());
        assert!(pattern.matches(&endpoint("GET /api/users/profile/photo")).is_none());
    }

    #[test]
    fn test_method_must_match() {
        let pattern = EndpointPattern::parse("POST /api/v1/auth/login").unwrap();
        assert!(pattern.matches(&endpoint("POST /api/v1/auth/login")).is_some());
        assert!(pattern.matches(&endpoint("GET /api/v1/auth/login")).is_none());
    }

    #[test]
    fn test_prefix_match_reports_literal_length() {
        let pattern = EndpointPattern::parse("/api/*").unwrap();
        let specificity = pattern.matches(&endpoint("GET /api/users/profile")).unwrap();
        assert!(!specificity.is_exact());
        assert_eq!(specificity.literal_len(), "/api/".len());
    }

    #[test]
    fn test_specificity_ordering() {
        let exact = EndpointPattern::parse("/api/users/profile").unwrap();
        let long_prefix = EndpointPattern::parse("/api/users/*").unwrap();
        let short_prefix = EndpointPattern::parse("/api/*").unwrap();
        let qualified_prefix = EndpointPattern::parse("GET /api/*").unwrap();
        let target = endpoint("GET /api/users/profile");

        let exact = exact.matches(&target).unwrap();
        let long_prefix = long_prefix.matches(&target).unwrap();
        let short_prefix = short_prefix.matches(&target).unwrap();
        let qualified_prefix = qualified_prefix.matches(&target).unwrap();

        assert!(exact > long_prefix);
        assert!(long_prefix > short_prefix);
        assert!(long_prefix > qualified_prefix);
        assert!(qualified_prefix > short_prefix);
    }

    #[test]
    fn test_definition_rejects_non_positive_values() {
        let zero_limit = PolicyDefinition::new(EntityType::Ip, "/x", 0, 60);
        assert!(matches!(zero_limit.validate(), Err(TollgateError::InvalidPolicy(_))));

        let negative_window = PolicyDefinition::new(EntityType::Ip, "/x", 10, -1);
        assert!(matches!(negative_window.validate(), Err(TollgateError::InvalidPolicy(_))));
    }

    #[test]
    fn test_parse_policy_file() {
        let yaml = r#"
policies:
  - endpoint_pattern: "POST /api/v1/auth/login"
    entity_type: ip
    requests_limit: 5
    window_size_seconds: 60
    description: Login brute-force protection
    failure_mode: fail_closed
  - endpoint_pattern: "/api/users/*"
    entity_type: user
    requests_limit: 600
    window_size_seconds: 60
    is_active: false
"#;
        let policies = PolicyFile::parse(yaml).unwrap();
        assert_eq!(policies.len(), 2);

        assert_eq!(policies[0].entity_type, EntityType::Ip);
        assert_eq!(policies[0].requests_limit, 5);
        assert_eq!(policies[0].failure_mode, Some(FailureMode::FailClosed));
        assert!(policies[0].is_active);

        assert_eq!(policies[1].entity_type, EntityType::User);
        assert!(!policies[1].is_active);
        assert_eq!(policies[1].failure_mode, None);
    }

    #[test]
    fn test_policy_file_rejected_as_a_whole() {
        let yaml = r#"
policies:
  - endpoint_pattern: "/ok"
    entity_type: ip
    requests_limit: 5
    window_size_seconds: 60
  - endpoint_pattern: "/broken"
    entity_type: ip
    requests_limit: 0
    window_size_seconds: 60
"#;
        assert!(matches!(PolicyFile::parse(yaml), Err(TollgateError::InvalidPolicy(_))));
    }

    #[test]
    fn test_unknown_entity_type_rejected() {
        let yaml = r#"
policies:
  - endpoint_pattern: "/ok"
    entity_type: tenant
    requests_limit: 5
    window_size_seconds: 60
"#;
        assert!(PolicyFile::parse(yaml).is_err());
        assert!("tenant".parse::<EntityType>().is_err());
        assert_eq!("api_key".parse::<EntityType>().unwrap(), EntityType::ApiKey);
    }

    #[test]
    fn test_tie_break_prefers_stricter_policy() {
        let strict = Policy::try_new(EntityType::Ip, "/x", 5, 60).unwrap();
        let loose = Policy::try_new(EntityType::Ip, "/x", 50, 60).unwrap();
        assert_eq!(strict.tie_break(&loose), Ordering::Less);
        assert_eq!(loose.tie_break(&strict), Ordering::Greater);
    }
}
