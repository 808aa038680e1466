/// Configuration management for the fulfillment service
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authority: AuthorityConfig,
    pub directory: DirectoryConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub core_db: PathBuf,
}

/// Authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Singular owner identity; short-circuits every capability check
    pub owner_id: String,
    /// How long resolved capability sets stay fresh, in seconds
    pub capability_cache_ttl: u64,
}

/// Static role-directory membership, one list per staff dimension.
///
/// The directory is an external collaborator in principle; this in-process
/// variant reads memberships from the environment so the service runs
/// standalone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub cooks: Vec<String>,
    pub couriers: Vec<String>,
    pub managers: Vec<String>,
    pub quota_exempt: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn id_list(var: &str) -> Vec<String> {
    env::var(var)
        .unwrap_or_else(|_| String::new())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> CoreResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("SUGARLINE_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("SUGARLINE_PORT")
            .unwrap_or_else(|_| "3280".to_string())
            .parse()
            .map_err(|_| CoreError::Validation("Invalid port number".to_string()))?;
        let version = env::var("SUGARLINE_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let data_directory: PathBuf = env::var("SUGARLINE_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let core_db = env::var("SUGARLINE_DB_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("core.sqlite"));

        let owner_id = env::var("SUGARLINE_OWNER_ID")
            .map_err(|_| CoreError::Validation("Owner identity required".to_string()))?;
        let capability_cache_ttl = env::var("SUGARLINE_CAPABILITY_CACHE_TTL")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                version,
            },
            storage: StorageConfig {
                data_directory,
                core_db,
            },
            authority: AuthorityConfig {
                owner_id,
                capability_cache_ttl,
            },
            directory: DirectoryConfig {
                cooks: id_list("SUGARLINE_COOK_IDS"),
                couriers: id_list("SUGARLINE_COURIER_IDS"),
                managers: id_list("SUGARLINE_MANAGER_IDS"),
                quota_exempt: id_list("SUGARLINE_QUOTA_EXEMPT_IDS"),
            },
            logging: LoggingConfig { level: log_level },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.service.hostname.is_empty() {
            return Err(CoreError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.authority.owner_id.is_empty() {
            return Err(CoreError::Validation(
                "Owner identity cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
