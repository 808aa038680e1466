/// Role-derived authorization
///
/// Capabilities are resolved from an external membership directory, with
/// an owner short-circuit and manager-implies-staff elevation. Lookups are
/// cached with an explicit staleness window so a slow or unreachable
/// directory cannot stall every gated operation; a failed lookup resolves
/// to no capabilities at all.
use crate::config::DirectoryConfig;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Capability required by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// No staff capability needed
    None,
    /// Any staff role
    Staff,
    Cook,
    Courier,
    Manager,
    Owner,
}

/// A staff dimension, as tracked by quotas and the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaffDimension {
    Cook,
    Courier,
}

/// Raw role memberships as reported by the directory
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleSet {
    pub cook: bool,
    pub courier: bool,
    pub manager: bool,
    pub quota_exempt: bool,
}

/// Resolved capability set for one identity
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub is_cook: bool,
    pub is_courier: bool,
    pub is_manager: bool,
    pub is_owner: bool,
    pub quota_exempt: bool,
}

impl CapabilitySet {
    pub fn all() -> Self {
        Self {
            is_cook: true,
            is_courier: true,
            is_manager: true,
            is_owner: true,
            quota_exempt: false,
        }
    }

    pub fn is_staff(&self) -> bool {
        self.is_cook || self.is_courier || self.is_manager
    }

    pub fn satisfies(&self, required: Capability) -> bool {
        match required {
            Capability::None => true,
            Capability::Staff => self.is_staff() || self.is_owner,
            Capability::Cook => self.is_cook || self.is_owner,
            Capability::Courier => self.is_courier || self.is_owner,
            Capability::Manager => self.is_manager || self.is_owner,
            Capability::Owner => self.is_owner,
        }
    }
}

/// Membership directory collaborator
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// Look up role memberships for an identity
    async fn lookup_roles(&self, identity: &str) -> anyhow::Result<RoleSet>;

    /// Current size of each staff role, (cooks, couriers)
    async fn role_counts(&self) -> anyhow::Result<(u64, u64)>;

    /// Remove a staff role from an identity
    async fn remove_role(&self, identity: &str, dimension: StaffDimension) -> anyhow::Result<()>;
}

/// In-process directory backed by configured membership lists
pub struct StaticDirectory {
    cooks: RwLock<HashSet<String>>,
    couriers: RwLock<HashSet<String>>,
    managers: HashSet<String>,
    quota_exempt: HashSet<String>,
}

impl StaticDirectory {
    pub fn new(config: &DirectoryConfig) -> Self {
        Self {
            cooks: RwLock::new(config.cooks.iter().cloned().collect()),
            couriers: RwLock::new(config.couriers.iter().cloned().collect()),
            managers: config.managers.iter().cloned().collect(),
            quota_exempt: config.quota_exempt.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl RoleDirectory for StaticDirectory {
    async fn lookup_roles(&self, identity: &str) -> anyhow::Result<RoleSet> {
        Ok(RoleSet {
            cook: self.cooks.read().await.contains(identity),
            courier: self.couriers.read().await.contains(identity),
            manager: self.managers.contains(identity),
            quota_exempt: self.quota_exempt.contains(identity),
        })
    }

    async fn role_counts(&self) -> anyhow::Result<(u64, u64)> {
        Ok((
            self.cooks.read().await.len() as u64,
            self.couriers.read().await.len() as u64,
        ))
    }

    async fn remove_role(&self, identity: &str, dimension: StaffDimension) -> anyhow::Result<()> {
        match dimension {
            StaffDimension::Cook => {
                self.cooks.write().await.remove(identity);
            }
            StaffDimension::Courier => {
                self.couriers.write().await.remove(identity);
            }
        }
        Ok(())
    }
}

struct CachedCaps {
    caps: CapabilitySet,
    resolved_at: DateTime<Utc>,
}

/// Capability resolver with a TTL cache over the directory
pub struct PermissionResolver {
    directory: Arc<dyn RoleDirectory>,
    owner_id: String,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedCaps>>,
}

impl PermissionResolver {
    pub fn new(directory: Arc<dyn RoleDirectory>, owner_id: String, ttl_secs: u64) -> Self {
        Self {
            directory,
            owner_id,
            ttl: Duration::seconds(ttl_secs as i64),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the capability set for an identity. Never fails: a
    /// directory error resolves to no capabilities.
    pub async fn resolve(&self, identity: &str) -> CapabilitySet {
        if identity == self.owner_id {
            return CapabilitySet::all();
        }

        let now = Utc::now();
        if let Some(cached) = self.cache.read().await.get(identity) {
            if now - cached.resolved_at < self.ttl {
                return cached.caps;
            }
        }

        let caps = match self.directory.lookup_roles(identity).await {
            Ok(roles) => CapabilitySet {
                is_cook: roles.cook || roles.manager,
                is_courier: roles.courier || roles.manager,
                is_manager: roles.manager,
                is_owner: false,
                quota_exempt: roles.quota_exempt,
            },
            Err(e) => {
                tracing::warn!("Directory lookup failed for {}: {}", identity, e);
                // Fail closed; do not cache the failure
                return CapabilitySet::default();
            }
        };

        self.cache.write().await.insert(
            identity.to_string(),
            CachedCaps {
                caps,
                resolved_at: now,
            },
        );

        caps
    }

    /// Drop stale entries from the capability cache
    pub async fn evict_stale(&self) {
        let now = Utc::now();
        let ttl = self.ttl;
        self.cache
            .write()
            .await
            .retain(|_, cached| now - cached.resolved_at < ttl);
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> DirectoryConfig {
        DirectoryConfig {
            cooks: vec!["cook-1".into()],
            couriers: vec!["courier-1".into()],
            managers: vec!["manager-1".into()],
            quota_exempt: vec!["cook-1".into()],
        }
    }

    fn resolver() -> PermissionResolver {
        PermissionResolver::new(
            Arc::new(StaticDirectory::new(&directory())),
            "owner-1".to_string(),
            300,
        )
    }

    #[tokio::test]
    async fn test_owner_short_circuits_to_everything() {
        let caps = resolver().resolve("owner-1").await;
        assert!(caps.is_owner);
        assert!(caps.satisfies(Capability::Manager));
        assert!(caps.satisfies(Capability::Cook));
        assert!(caps.satisfies(Capability::Courier));
    }

    #[tokio::test]
    async fn test_manager_implies_cook_and_courier() {
        let caps = resolver().resolve("manager-1").await;
        assert!(caps.is_manager);
        assert!(caps.is_cook);
        assert!(caps.is_courier);
        assert!(!caps.is_owner);
        assert!(!caps.satisfies(Capability::Owner));
    }

    #[tokio::test]
    async fn test_cook_is_only_a_cook() {
        let caps = resolver().resolve("cook-1").await;
        assert!(caps.is_cook);
        assert!(!caps.is_courier);
        assert!(!caps.is_manager);
        assert!(caps.quota_exempt);
        assert!(caps.satisfies(Capability::Cook));
        assert!(!caps.satisfies(Capability::Manager));
    }

    #[tokio::test]
    async fn test_unknown_identity_resolves_to_nothing() {
        let caps = resolver().resolve("stranger").await;
        assert!(!caps.is_staff());
        assert!(caps.satisfies(Capability::None));
        assert!(!caps.satisfies(Capability::Cook));
    }

    struct FailingDirectory;

    #[async_trait]
    impl RoleDirectory for FailingDirectory {
        async fn lookup_roles(&self, _identity: &str) -> anyhow::Result<RoleSet> {
            anyhow::bail!("directory unreachable")
        }

        async fn role_counts(&self) -> anyhow::Result<(u64, u64)> {
            anyhow::bail!("directory unreachable")
        }

        async fn remove_role(
            &self,
            _identity: &str,
            _dimension: StaffDimension,
        ) -> anyhow::Result<()> {
            anyhow::bail!("directory unreachable")
        }
    }

    #[tokio::test]
    async fn test_directory_failure_fails_closed() {
        let resolver =
            PermissionResolver::new(Arc::new(FailingDirectory), "owner-1".to_string(), 300);

        let caps = resolver.resolve("manager-1").await;
        assert!(!caps.is_staff());

        // Owner short-circuit still works without the directory
        assert!(resolver.resolve("owner-1").await.is_owner);
    }

    #[tokio::test]
    async fn test_role_removal_is_visible_after_cache_expiry() {
        let dir = Arc::new(StaticDirectory::new(&directory()));
        let resolver = PermissionResolver::new(dir.clone(), "owner-1".to_string(), 0);

        assert!(resolver.resolve("cook-1").await.is_cook);
        dir.remove_role("cook-1", StaffDimension::Cook).await.unwrap();
        assert!(!resolver.resolve("cook-1").await.is_cook);
    }
}
