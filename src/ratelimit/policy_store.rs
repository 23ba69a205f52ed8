//! Policy sources.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::info;

use super::policy::{EntityType, EndpointPattern, Policy, PolicyDefinition, PolicyFile};
use crate::error::{Result, TollgateError};

/// Read side of wherever policies are administered.
#[async_trait]
pub trait PolicyStore: Send + Sync + std::fmt::Debug {
    /// Load every policy, active or not. Every returned policy is valid.
    async fn load_policies(&self) -> Result<Vec<Policy>>;
}

/// Policies held in memory, written through validating operations.
#[derive(Debug, Default)]
pub struct StaticPolicyStore {
    policies: RwLock<Vec<Policy>>,
}

impl StaticPolicyStore {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self {
            policies: RwLock::new(policies),
        }
    }

    /// Validate all definitions; nothing is stored if any is invalid.
    pub fn from_definitions(definitions: &[PolicyDefinition]) -> Result<Self> {
        let policies = definitions
            .iter()
            .map(PolicyDefinition::validate)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(policies))
    }

    /// Insert a policy, replacing any with the same entity type and pattern.
    pub fn upsert(&self, definition: &PolicyDefinition) -> Result<()> {
        let policy = definition.validate()?;
        let mut policies = self.policies.write();

        match policies.iter_mut().find(|p| {
            p.entity_type == policy.entity_type && p.endpoint_pattern == policy.endpoint_pattern
        }) {
            Some(existing) => *existing = policy,
            None => policies.push(policy),
        }
        Ok(())
    }

    /// Mark a policy inactive. Returns `false` if no such policy exists.
    pub fn deactivate(&self, entity_type: EntityType, pattern: &str) -> Result<bool> {
        let pattern = EndpointPattern::parse(pattern)?;
        let mut policies = self.policies.write();

        let found = policies
            .iter_mut()
            .find(|p| p.entity_type == entity_type && p.endpoint_pattern == pattern);
        Ok(match found {
            Some(policy) => {
                policy.is_active = false;
                true
            }
            None => false,
        })
    }

    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn load_policies(&self) -> Result<Vec<Policy>> {
        Ok(self.policies.read().clone())
    }
}

/// Policies read from a YAML file on every load.
#[derive(Debug, Clone)]
pub struct FilePolicyStore {
    path: PathBuf,
}

impl FilePolicyStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn load_policies(&self) -> Result<Vec<Policy>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            TollgateError::PolicyStore(format!("{}: {}", self.path.display(), e))
        })?;
        let policies = PolicyFile::parse(&contents)?;

        info!(
            path = %self.path.display(),
            count = policies.len(),
            "Loaded rate limit policies"
        );
        Ok(policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_static_store_upsert_replaces_same_pattern() {
        let store = StaticPolicyStore::default();
        store
            .upsert(&PolicyDefinition::new(EntityType::Ip, "/login", 5, 60))
            .unwrap();
        store
            .upsert(&PolicyDefinition::new(EntityType::Ip, "/login", 10, 60))
            .unwrap();
        store
            .upsert(&PolicyDefinition::new(EntityType::User, "/login", 20, 60))
            .unwrap();

        let policies = store.load_policies().await.unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].requests_limit, 10);
    }

    #[tokio::test]
    async fn test_static_store_rejects_invalid_write() {
        let store = StaticPolicyStore::default();
        let result = store.upsert(&PolicyDefinition::new(EntityType::Ip, "/login", 0, 60));
        assert!(matches!(result, Err(TollgateError::InvalidPolicy(_))));
        assert!(store.is_empty());

        let definitions = vec![
            PolicyDefinition::new(EntityType::Ip, "/ok", 1, 1),
            PolicyDefinition::new(EntityType::Ip, "/bad/*/x", 1, 1),
        ];
        assert!(StaticPolicyStore::from_definitions(&definitions).is_err());
    }

    #[tokio::test]
    async fn test_static_store_deactivate() {
        let store = StaticPolicyStore::from_definitions(&[PolicyDefinition::new(
            EntityType::Ip,
            "/login",
            5,
            60,
        )])
        .unwrap();

        assert!(store.deactivate(EntityType::Ip, "/login").unwrap());
        assert!(!store.deactivate(EntityType::User, "/login").unwrap());

        let policies = store.load_policies().await.unwrap();
        assert!(!policies[0].is_active);
    }

    #[tokio::test]
    async fn test_file_store_loads_yaml() {
        let path = std::env::temp_dir()
            .join(format!("tollgate-policies-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"policies:
  - endpoint_pattern: "POST /api/v1/auth/login"
    entity_type: ip
    requests_limit: 5
    window_size_seconds: 60"#
        )
        .unwrap();

        let store = FilePolicyStore::new(&path);
        let policies = store.load_policies().await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].requests_limit, 5);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_file_store_missing_file() {
        let store = FilePolicyStore::new("/nonexistent/tollgate/policies.yaml");
        assert!(matches!(
            store.load_policies().await,
            Err(TollgateError::PolicyStore(_))
        ));
    }
}
