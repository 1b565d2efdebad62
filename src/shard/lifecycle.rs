// Shard group lifecycle manager (§4.7).
//
// Owns the "create a shard group" and "restart a shard group" workflows:
// provision storage, stand up the event cache first (the reader and
// writer both need its URL before they can start), then the reader and
// writer together, waiting on availability between steps so a caller
// never gets back control while a deployment is still starting up.
// Restart follows the same shape in reverse: scale everything to zero,
// wait for the pods to actually disappear, then scale back up in the
// same dependency order.

use super::config::{
    build_environment, AppSettingsConfigurer, EventCacheConnection, NodeSettings, StorageCreator,
    StorageCredentials,
};
use super::k8s::{Deployment, KubernetesClient, ScalePatch, Service};
use super::{deployment_name, hash_range_string, DataElement, ShardRole};
use crate::error::{AccessError, Result};
use crate::metrics::MetricLogger;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long to wait between polls, and the abort threshold, for one
/// wait-predicate loop.
#[derive(Debug, Clone, Copy)]
pub struct WaitConfig {
    pub check_interval_ms: u64,
    pub abort_timeout_ms: u64,
}

impl WaitConfig {
    /// `(startup_failure_threshold + 1) * startup_period_seconds * 1000`.
    pub fn for_availability(check_interval_ms: u64, startup_failure_threshold: u32, startup_period_seconds: u64) -> Self {
        Self {
            check_interval_ms,
            abort_timeout_ms: (startup_failure_threshold as u64 + 1) * startup_period_seconds * 1000,
        }
    }

    /// `termination_grace_period_seconds * 1000 + grace_buffer_ms`.
    pub fn for_scale_down(check_interval_ms: u64, termination_grace_period_seconds: u64, grace_buffer_ms: u64) -> Self {
        Self {
            check_interval_ms,
            abort_timeout_ms: termination_grace_period_seconds * 1000 + grace_buffer_ms,
        }
    }
}

pub struct ShardGroupLifecycleManager {
    client: Arc<dyn KubernetesClient>,
    storage_creator: Arc<dyn StorageCreator>,
    appsettings_configurer: Arc<dyn AppSettingsConfigurer>,
    metrics: Arc<dyn MetricLogger>,
    namespace: String,
}

impl ShardGroupLifecycleManager {
    pub fn new(
        client: Arc<dyn KubernetesClient>,
        storage_creator: Arc<dyn StorageCreator>,
        appsettings_configurer: Arc<dyn AppSettingsConfigurer>,
        metrics: Arc<dyn MetricLogger>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            storage_creator,
            appsettings_configurer,
            metrics,
            namespace: namespace.into(),
        }
    }

    fn service_url(&self, name: &str) -> String {
        format!("http://{name}.{}", self.namespace)
    }

    async fn wait_for_availability(&self, deployment_name: &str, config: WaitConfig) -> Result<()> {
        let start = Instant::now();
        loop {
            let deployments = self.client.list_deployments(&self.namespace)?;
            let available = deployments
                .iter()
                .any(|d| d.name == deployment_name && d.available_replicas.map_or(false, |r| r > 0));
            if available {
                return Ok(());
            }
            let waited = start.elapsed().as_millis() as u64;
            if waited >= config.abort_timeout_ms {
                return Err(AccessError::WaitTimeout {
                    waited_ms: waited,
                    context: format!("waiting for deployment '{deployment_name}' to become available"),
                });
            }
            tokio::time::sleep(Duration::from_millis(config.check_interval_ms)).await;
        }
    }

    async fn wait_for_scale_down(&self, deployment_name: &str, config: WaitConfig) -> Result<()> {
        let start = Instant::now();
        loop {
            let pods = self.client.list_pods(&self.namespace)?;
            let remaining = pods.iter().any(|p| p.deployment_name == deployment_name);
            if !remaining {
                return Ok(());
            }
            let waited = start.elapsed().as_millis() as u64;
            if waited >= config.abort_timeout_ms {
                return Err(AccessError::WaitTimeout {
                    waited_ms: waited,
                    context: format!("waiting for deployment '{deployment_name}' to scale down"),
                });
            }
            tokio::time::sleep(Duration::from_millis(config.check_interval_ms)).await;
        }
    }

    async fn create_role_deployment(
        &self,
        name: &str,
        event_cache_url: &str,
        credentials: &StorageCredentials,
        listen_port: u16,
        minimum_log_level: &str,
    ) -> Result<()> {
        let mut settings = NodeSettings {
            event_cache_connection: EventCacheConnection { host: event_cache_url.to_string() },
            ..NodeSettings::default()
        };
        self.appsettings_configurer.inject_credentials(&mut settings, credentials);
        let env = build_environment(&settings, listen_port, minimum_log_level)?.into_pairs();

        self.client.create_deployment(&Deployment {
            name: name.to_string(),
            namespace: self.namespace.clone(),
            replicas: 1,
            available_replicas: None,
            env,
        })?;
        self.client.create_service(&Service {
            name: name.to_string(),
            namespace: self.namespace.clone(),
            cluster_internal_url: self.service_url(name),
        })?;
        Ok(())
    }

    /// Provisions storage (unless `existing_credentials` is supplied, for
    /// restoring a previously-created group), then stands up the event
    /// cache, reader, and writer deployments in dependency order.
    pub async fn create_shard_group(
        &self,
        element: DataElement,
        hash_range_start: i32,
        existing_credentials: Option<StorageCredentials>,
        availability_wait: WaitConfig,
    ) -> Result<StorageCredentials> {
        let credentials = match existing_credentials {
            Some(c) => c,
            None => {
                let store_name = format!("accessmanager_{}_{}", element, hash_range_string(hash_range_start));
                self.storage_creator.create_store(&store_name)?
            }
        };

        let event_cache_name = deployment_name(element, ShardRole::EventCache, hash_range_start);
        self.client.create_deployment(&Deployment {
            name: event_cache_name.clone(),
            namespace: self.namespace.clone(),
            replicas: 1,
            available_replicas: None,
            env: vec![],
        })?;
        self.client.create_service(&Service {
            name: event_cache_name.clone(),
            namespace: self.namespace.clone(),
            cluster_internal_url: self.service_url(&event_cache_name),
        })?;
        self.wait_for_availability(&event_cache_name, availability_wait).await?;

        let event_cache_url = self.service_url(&event_cache_name);
        let reader_name = deployment_name(element, ShardRole::Reader, hash_range_start);
        let writer_name = deployment_name(element, ShardRole::Writer, hash_range_start);

        // Reader and writer have no dependency on each other, only on the
        // event cache above, so they're created and waited on in parallel.
        tokio::try_join!(
            self.create_role_deployment(&reader_name, &event_cache_url, &credentials, 5000, "Information"),
            self.create_role_deployment(&writer_name, &event_cache_url, &credentials, 5000, "Information"),
        )?;
        tokio::try_join!(
            self.wait_for_availability(&reader_name, availability_wait),
            self.wait_for_availability(&writer_name, availability_wait),
        )?;

        self.metrics.increment("shard-group-created", 1);
        Ok(credentials)
    }

    /// Scales a shard group's three deployments to zero, waits for their
    /// pods to actually terminate, then scales them back up -- event
    /// cache first, then reader and writer -- waiting on availability at
    /// each step.
    pub async fn restart_shard_group(
        &self,
        element: DataElement,
        hash_range_start: i32,
        scale_down_wait: WaitConfig,
        availability_wait: WaitConfig,
    ) -> Result<()> {
        let names = [
            deployment_name(element, ShardRole::EventCache, hash_range_start),
            deployment_name(element, ShardRole::Reader, hash_range_start),
            deployment_name(element, ShardRole::Writer, hash_range_start),
        ];

        for name in &names {
            self.client.patch_deployment_scale(name, &self.namespace, ScalePatch { replicas: 0 })?;
        }
        for name in &names {
            self.wait_for_scale_down(name, scale_down_wait).await?;
        }

        self.client.patch_deployment_scale(&names[0], &self.namespace, ScalePatch { replicas: 1 })?;
        self.wait_for_availability(&names[0], availability_wait).await?;

        // Same reasoning as create_shard_group: reader and writer scale up
        // and become available independently of each other.
        let reader_name = &names[1];
        let writer_name = &names[2];
        self.client.patch_deployment_scale(reader_name, &self.namespace, ScalePatch { replicas: 1 })?;
        self.client.patch_deployment_scale(writer_name, &self.namespace, ScalePatch { replicas: 1 })?;
        tokio::try_join!(
            self.wait_for_availability(reader_name, availability_wait),
            self.wait_for_availability(writer_name, availability_wait),
        )?;

        self.metrics.increment("shard-group-restarted", 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetricLogger;
    use crate::shard::config::{DefaultAppSettingsConfigurer, InMemoryStorageCreator};
    use crate::shard::k8s::InMemoryKubernetesClient;

    fn manager() -> (ShardGroupLifecycleManager, Arc<InMemoryKubernetesClient>) {
        let client = Arc::new(InMemoryKubernetesClient::new());
        let manager = ShardGroupLifecycleManager::new(
            client.clone(),
            Arc::new(InMemoryStorageCreator::new()),
            Arc::new(DefaultAppSettingsConfigurer),
            Arc::new(InMemoryMetricLogger::new()),
            "access-manager",
        );
        (manager, client)
    }

    #[tokio::test]
    async fn create_shard_group_times_out_if_event_cache_never_becomes_available() {
        let (manager, _client) = manager();
        let wait = WaitConfig::for_availability(5, 0, 0);
        let err = manager
            .create_shard_group(DataElement::User, 0, None, wait)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn create_shard_group_succeeds_once_every_deployment_reports_available() {
        let (manager, client) = manager();
        let wait = WaitConfig::for_availability(5, 1, 1);

        let handle = tokio::spawn(async move { manager.create_shard_group(DataElement::Group, 100, None, wait).await });

        // give the orchestrator a moment to create the event cache, then
        // mark each dependency available in the order the manager waits
        // on them.
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.mark_available("group-eventcache-100", 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.mark_available("group-reader-100", 1);
        client.mark_available("group-writer-100", 1);

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn restart_shard_group_times_out_while_pods_remain() {
        let (manager, client) = manager();
        for name in ["user-eventcache-0", "user-reader-0", "user-writer-0"] {
            client
                .create_deployment(&Deployment {
                    name: name.to_string(),
                    namespace: "access-manager".to_string(),
                    replicas: 1,
                    available_replicas: Some(1),
                    env: vec![],
                })
                .unwrap();
        }
        let scale_down = WaitConfig::for_scale_down(5, 0, 0);
        let availability = WaitConfig::for_availability(5, 0, 0);
        let err = manager
            .restart_shard_group(DataElement::User, 0, scale_down, availability)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn restart_shard_group_succeeds_once_pods_terminate_and_come_back_available() {
        let (manager, client) = manager();
        let names = ["user-eventcache-0", "user-reader-0", "user-writer-0"];
        for name in names {
            client
                .create_deployment(&Deployment {
                    name: name.to_string(),
                    namespace: "access-manager".to_string(),
                    replicas: 1,
                    available_replicas: Some(1),
                    env: vec![],
                })
                .unwrap();
        }
        let scale_down = WaitConfig::for_scale_down(5, 5, 0);
        let availability = WaitConfig::for_availability(5, 5, 1);

        let handle =
            tokio::spawn(async move { manager.restart_shard_group(DataElement::User, 0, scale_down, availability).await });

        tokio::time::sleep(Duration::from_millis(15)).await;
        for name in names {
            client.terminate_pods(name);
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
        for name in names {
            client.mark_available(name, 1);
        }

        assert!(handle.await.unwrap().is_ok());
    }
}
