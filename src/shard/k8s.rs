// Kubernetes client shim (§6).
//
// The lifecycle manager never talks to the cluster API directly; it goes
// through this trait so tests can substitute an in-memory cluster. A real
// implementation would wrap `kube-rs`, out of scope here.

use crate::error::{AccessError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    pub namespace: String,
    pub replicas: u32,
    pub available_replicas: Option<u32>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub deployment_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub cluster_internal_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePatch {
    pub replicas: u32,
}

pub trait KubernetesClient: Send + Sync {
    fn create_deployment(&self, def: &Deployment) -> Result<()>;
    fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>>;
    fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
    fn create_service(&self, def: &Service) -> Result<()>;
    fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;
    fn patch_deployment_scale(&self, name: &str, namespace: &str, patch: ScalePatch) -> Result<()>;
}

/// In-memory cluster for tests.
///
/// Scaling a deployment to zero does not, by itself, remove its pods --
/// a real kubelet takes a termination grace period to catch up, which is
/// exactly the gap `wait_for_scale_down` polls across. Pods here persist
/// until a test calls `terminate_pods`, and `available_replicas` only
/// follows an explicit `mark_available`/`mark_unavailable` call, so tests
/// can drive both timings independently of a real scheduler.
#[derive(Default)]
pub struct InMemoryKubernetesClient {
    deployments: Mutex<HashMap<String, Deployment>>,
    services: Mutex<HashMap<String, Service>>,
    pods: Mutex<HashMap<String, Vec<Pod>>>,
}

impl InMemoryKubernetesClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_available(&self, name: &str, available_replicas: u32) {
        if let Some(d) = self.deployments.lock().get_mut(name) {
            d.available_replicas = Some(available_replicas);
        }
    }

    pub fn mark_unavailable(&self, name: &str) {
        if let Some(d) = self.deployments.lock().get_mut(name) {
            d.available_replicas = None;
        }
    }

    /// Simulates the kubelet finishing termination for every pod backing
    /// `deployment_name`.
    pub fn terminate_pods(&self, deployment_name: &str) {
        self.pods.lock().remove(deployment_name);
    }

    pub fn pod_count(&self, deployment_name: &str) -> usize {
        self.pods.lock().get(deployment_name).map(|p| p.len()).unwrap_or(0)
    }
}

impl KubernetesClient for InMemoryKubernetesClient {
    fn create_deployment(&self, def: &Deployment) -> Result<()> {
        let replica_pods: Vec<Pod> = (0..def.replicas.max(1))
            .map(|i| Pod {
                name: format!("{}-{i}", def.name),
                namespace: def.namespace.clone(),
                deployment_name: def.name.clone(),
            })
            .collect();
        self.pods.lock().insert(def.name.clone(), replica_pods);
        self.deployments.lock().insert(def.name.clone(), def.clone());
        Ok(())
    }

    fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .deployments
            .lock()
            .values()
            .filter(|d| d.namespace == namespace)
            .cloned()
            .collect())
    }

    fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .values()
            .flatten()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect())
    }

    fn create_service(&self, def: &Service) -> Result<()> {
        self.services.lock().insert(def.name.clone(), def.clone());
        Ok(())
    }

    fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        Ok(self
            .services
            .lock()
            .values()
            .filter(|s| s.namespace == namespace)
            .cloned()
            .collect())
    }

    fn patch_deployment_scale(&self, name: &str, namespace: &str, patch: ScalePatch) -> Result<()> {
        let mut deployments = self.deployments.lock();
        let deployment = deployments
            .get_mut(name)
            .filter(|d| d.namespace == namespace)
            .ok_or_else(|| AccessError::NotFound(format!("deployment '{name}' not found")))?;
        deployment.replicas = patch.replicas;
        if patch.replicas == 0 {
            deployment.available_replicas = None;
        }
        Ok(())
    }
}
