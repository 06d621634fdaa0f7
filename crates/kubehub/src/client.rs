//! Cluster access used by the apply engine, the disable path and the status writer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use driftless_core::Gvk;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("resource type {0} is not served by the cluster")]
    UnknownKind(Gvk),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message),
            kube::Error::Api(ae) => ClusterError::Api { code: ae.code, message: ae.message },
            other => ClusterError::Other(other.into()),
        }
    }
}

/// Server-side apply options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyParams {
    pub field_manager: String,
    /// Take ownership of fields held by other managers.
    pub force: bool,
}

/// The handful of API verbs the reconciler needs, over untyped objects.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, ClusterError>;

    /// Server-side apply; returns the object as stored.
    async fn apply(&self, gvk: &Gvk, obj: &DynamicObject, params: &ApplyParams) -> Result<DynamicObject, ClusterError>;

    /// Full replace of an existing object.
    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Delete; a missing object is not an error.
    async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<(), ClusterError>;

    /// JSON merge patch of the status subresource.
    async fn patch_status(&self, gvk: &Gvk, namespace: Option<&str>, name: &str, status: &Json) -> Result<(), ClusterError>;
}

pub(crate) fn object_name(obj: &DynamicObject) -> Result<&str, ClusterError> {
    obj.metadata.name.as_deref().ok_or_else(|| ClusterError::Invalid("object missing metadata.name".into()))
}

/// [`ClusterClient`] backed by a live API server.
pub struct KubeCluster {
    client: Client,
    resources: Mutex<HashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(HashMap::new()) }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::get_kube_client().await?))
    }

    pub fn client(&self) -> Client { self.client.clone() }

    async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool), ClusterError> {
        let cached = self.resources.lock().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        counter!("kube_discovery_runs_total", 1u64);
        let found = crate::find_api_resource(self.client.clone(), gvk).await?;
        let (ar, namespaced) = found.ok_or_else(|| ClusterError::UnknownKind(gvk.clone()))?;
        debug!(gvk = %gvk, namespaced, "resolved api resource");
        self.resources.lock().unwrap_or_else(|e| e.into_inner()).insert(gvk.clone(), (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.resolve(gvk).await?;
        if namespaced {
            match namespace {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(ClusterError::Invalid(format!("namespace required for namespaced kind {}", gvk))),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, ClusterError> {
        let api = self.api(gvk, namespace).await?;
        Ok(api.get_opt(name).await?)
    }

    async fn apply(&self, gvk: &Gvk, obj: &DynamicObject, params: &ApplyParams) -> Result<DynamicObject, ClusterError> {
        let api = self.api(gvk, obj.metadata.namespace.as_deref()).await?;
        let mut pp = PatchParams::apply(&params.field_manager);
        if params.force {
            pp = pp.force();
        }
        Ok(api.patch(object_name(obj)?, &pp, &Patch::Apply(obj)).await?)
    }

    async fn update(&self, gvk: &Gvk, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let api = self.api(gvk, obj.metadata.namespace.as_deref()).await?;
        Ok(api.replace(object_name(obj)?, &PostParams::default(), obj).await?)
    }

    async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        let api = self.api(gvk, namespace).await?;
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(&self, gvk: &Gvk, namespace: Option<&str>, name: &str, status: &Json) -> Result<(), ClusterError> {
        let api = self.api(gvk, namespace).await?;
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}
