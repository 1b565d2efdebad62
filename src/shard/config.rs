// Per-node appsettings tree and the Base64 env-var bridge used to hand a
// freshly created pod its configuration (§4.7, §6, §6.1).
//
// A shard-group node (event cache, reader, or writer) receives its whole
// configuration as a single environment variable,
// `ENCODED_JSON_CONFIGURATION`, holding the Base64 form of the JSON
// serialization of `NodeSettings`. `MODE`, `LISTEN_PORT`, and
// `MINIMUM_LOG_LEVEL` ride alongside it as plain env vars.

use crate::error::{AccessError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub connection_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SqlDatabaseConnection {
    pub connection_parameters: ConnectionParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct EventCacheConnection {
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct EventPersistence {
    pub event_persister_backup_file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MetricLogging {
    pub metric_category_suffix: String,
}

/// Router state distinguishing a split's source and target shards
/// (§6's `ShardRouting.*` paths).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ShardRouting {
    pub data_element_type: String,
    pub source_query_shard_base_url: String,
    pub source_event_shard_base_url: String,
    pub source_shard_hash_range_start: i32,
    pub source_shard_hash_range_end: i32,
    pub target_query_shard_base_url: String,
    pub target_event_shard_base_url: String,
    pub target_shard_hash_range_start: i32,
    pub target_shard_hash_range_end: i32,
    pub routing_initially_on: bool,
}

/// The settings tree an individual shard-group node reads at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct NodeSettings {
    pub access_manager_sql_database_connection: SqlDatabaseConnection,
    pub event_cache_connection: EventCacheConnection,
    pub event_persistence: EventPersistence,
    pub metric_logging: MetricLogging,
    pub shard_routing: Option<ShardRouting>,
}

/// Checks the handful of paths the node cannot start without, failing
/// fast with a named path rather than letting the node crash on first use.
pub fn validate_required_paths(settings: &NodeSettings) -> Result<()> {
    if settings.access_manager_sql_database_connection.connection_parameters.connection_string.is_empty() {
        return Err(AccessError::Configuration(
            "AccessManagerSqlDatabaseConnection:ConnectionParameters:ConnectionString is required".to_string(),
        ));
    }
    if settings.event_cache_connection.host.is_empty() {
        return Err(AccessError::Configuration("EventCacheConnection:Host is required".to_string()));
    }
    if settings.event_persistence.event_persister_backup_file_path.is_empty() {
        return Err(AccessError::Configuration(
            "EventPersistence:EventPersisterBackupFilePath is required".to_string(),
        ));
    }
    if settings.metric_logging.metric_category_suffix.is_empty() {
        return Err(AccessError::Configuration("MetricLogging:MetricCategorySuffix is required".to_string()));
    }
    if let Some(routing) = &settings.shard_routing {
        if routing.data_element_type.is_empty() {
            return Err(AccessError::Configuration("ShardRouting:DataElementType is required".to_string()));
        }
        if routing.source_query_shard_base_url.is_empty() {
            return Err(AccessError::Configuration("ShardRouting:SourceQueryShardBaseUrl is required".to_string()));
        }
        if routing.source_event_shard_base_url.is_empty() {
            return Err(AccessError::Configuration("ShardRouting:SourceEventShardBaseUrl is required".to_string()));
        }
        if routing.target_query_shard_base_url.is_empty() {
            return Err(AccessError::Configuration("ShardRouting:TargetQueryShardBaseUrl is required".to_string()));
        }
        if routing.target_event_shard_base_url.is_empty() {
            return Err(AccessError::Configuration("ShardRouting:TargetEventShardBaseUrl is required".to_string()));
        }
    }
    Ok(())
}

pub fn encode_configuration(settings: &NodeSettings) -> Result<String> {
    let json = serde_json::to_vec(settings)?;
    Ok(BASE64.encode(json))
}

pub fn decode_configuration(encoded: &str) -> Result<NodeSettings> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| AccessError::Configuration(format!("invalid base64 configuration: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// The four env vars a shard-group pod is launched with (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEnvironment {
    pub mode: String,
    pub listen_port: u16,
    pub minimum_log_level: String,
    pub encoded_json_configuration: String,
}

impl NodeEnvironment {
    pub fn into_pairs(self) -> Vec<(String, String)> {
        vec![
            ("MODE".to_string(), self.mode),
            ("LISTEN_PORT".to_string(), self.listen_port.to_string()),
            ("MINIMUM_LOG_LEVEL".to_string(), self.minimum_log_level),
            ("ENCODED_JSON_CONFIGURATION".to_string(), self.encoded_json_configuration),
        ]
    }
}

pub fn build_environment(
    settings: &NodeSettings,
    listen_port: u16,
    minimum_log_level: impl Into<String>,
) -> Result<NodeEnvironment> {
    validate_required_paths(settings)?;
    Ok(NodeEnvironment {
        mode: "Launch".to_string(),
        listen_port,
        minimum_log_level: minimum_log_level.into(),
        encoded_json_configuration: encode_configuration(settings)?,
    })
}

/// Credentials handed back by a freshly provisioned backing store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageCredentials {
    pub connection_string: String,
}

/// Provisions a new backing store for a shard group (§6.1).
pub trait StorageCreator: Send + Sync {
    fn create_store(&self, name: &str) -> Result<StorageCredentials>;
}

/// Writes provisioned credentials into the settings tree that will be
/// handed to the node as its `ENCODED_JSON_CONFIGURATION` (§6.1).
pub trait AppSettingsConfigurer: Send + Sync {
    fn inject_credentials(&self, settings: &mut NodeSettings, credentials: &StorageCredentials);
}

pub struct DefaultAppSettingsConfigurer;

impl AppSettingsConfigurer for DefaultAppSettingsConfigurer {
    fn inject_credentials(&self, settings: &mut NodeSettings, credentials: &StorageCredentials) {
        settings.access_manager_sql_database_connection.connection_parameters.connection_string =
            credentials.connection_string.clone();
    }
}

pub struct InMemoryStorageCreator {
    pub created: Mutex<Vec<String>>,
}

impl InMemoryStorageCreator {
    pub fn new() -> Self {
        Self { created: Mutex::new(Vec::new()) }
    }
}

impl Default for InMemoryStorageCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageCreator for InMemoryStorageCreator {
    fn create_store(&self, name: &str) -> Result<StorageCredentials> {
        self.created.lock().push(name.to_string());
        Ok(StorageCredentials { connection_string: format!("mem://{name}") })
    }
}
