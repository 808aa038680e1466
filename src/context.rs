/// Application context and dependency injection
use crate::{
    blocks::ServerBlocks,
    config::ServerConfig,
    db,
    discipline::Discipline,
    error::CoreResult,
    ledger::Ledger,
    notify::{LogArchive, LogSink, NotificationSink, OrderArchive},
    orders::OrderMachine,
    perms::{PermissionResolver, RoleDirectory, StaticDirectory},
    quota::QuotaEngine,
    scripts::DeliveryScripts,
    vip::VipCodes,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub ledger: Ledger,
    pub orders: OrderMachine,
    pub discipline: Discipline,
    pub quota: Arc<QuotaEngine>,
    pub resolver: Arc<PermissionResolver>,
    pub vip_codes: VipCodes,
    pub scripts: DeliveryScripts,
    pub blocks: ServerBlocks,
    pub notifier: Arc<dyn NotificationSink>,
}

impl AppContext {
    /// Create a new application context from configuration, using the
    /// in-process directory and tracing-backed sinks
    pub async fn new(config: ServerConfig) -> CoreResult<Self> {
        config.validate()?;

        let pool = db::create_pool(&config.storage.core_db, db::DatabaseOptions::default()).await?;
        db::run_migrations(&pool).await?;
        db::test_connection(&pool).await?;

        let directory: Arc<dyn RoleDirectory> = Arc::new(StaticDirectory::new(&config.directory));
        Self::with_collaborators(config, pool, directory, Arc::new(LogSink), Arc::new(LogArchive))
    }

    /// Wire the context around explicit collaborators. This is the seam
    /// for swapping in a real directory or notification gateway.
    pub fn with_collaborators(
        config: ServerConfig,
        pool: SqlitePool,
        directory: Arc<dyn RoleDirectory>,
        notifier: Arc<dyn NotificationSink>,
        archive: Arc<dyn OrderArchive>,
    ) -> CoreResult<Self> {
        let ledger = Ledger::new(pool.clone());
        let blocks = ServerBlocks::new(pool.clone());
        let orders = OrderMachine::new(
            pool.clone(),
            ledger.clone(),
            blocks.clone(),
            notifier.clone(),
            archive,
        );
        let discipline = Discipline::new(pool.clone());
        let quota = Arc::new(QuotaEngine::new(
            pool.clone(),
            directory.clone(),
            notifier.clone(),
        ));
        let resolver = Arc::new(PermissionResolver::new(
            directory,
            config.authority.owner_id.clone(),
            config.authority.capability_cache_ttl,
        ));
        let vip_codes = VipCodes::new(pool.clone());
        let scripts = DeliveryScripts::new(pool.clone());

        Ok(Self {
            config: Arc::new(config),
            db: pool,
            ledger,
            orders,
            discipline,
            quota,
            resolver,
            vip_codes,
            scripts,
            blocks,
            notifier,
        })
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{
        AuthorityConfig, DirectoryConfig, LoggingConfig, ServiceConfig, StorageConfig,
    };

    pub fn test_config(directory: DirectoryConfig) -> ServerConfig {
        ServerConfig {
            service: ServiceConfig {
                hostname: "localhost".to_string(),
                port: 0,
                version: "test".to_string(),
            },
            storage: StorageConfig {
                data_directory: "/tmp".into(),
                core_db: "/tmp/test.sqlite".into(),
            },
            authority: AuthorityConfig {
                owner_id: "owner-1".to_string(),
                capability_cache_ttl: 0,
            },
            directory,
            logging: LoggingConfig {
                level: "debug".to_string(),
            },
        }
    }

    /// Context over an in-memory database and a configured directory
    pub async fn test_context(directory: DirectoryConfig) -> AppContext {
        let pool = crate::db::test_pool().await;
        let config = test_config(directory.clone());
        AppContext::with_collaborators(
            config,
            pool,
            Arc::new(StaticDirectory::new(&directory)),
            Arc::new(LogSink),
            Arc::new(LogArchive),
        )
        .unwrap()
    }
}
