//! Keel kubehub – cluster client over kube dynamic objects, and a watcher
//! that reports remote changes of managed kinds.
//!
//! Node kinds are read as GVK keys: `v1/ConfigMap` or `apps/v1/Deployment`.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use keel_core::{ClusterClient, ClusterError, NodeId, RemoteEvent, Spec};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Map an HTTP status from the API server onto retryable vs rejected.
pub fn classify_status(code: u16, message: &str) -> ClusterError {
    match code {
        400 | 401 | 403 | 405 | 422 => ClusterError::Rejected(format!("{}: {}", code, message)),
        _ => ClusterError::Transient(format!("{}: {}", code, message)),
    }
}

fn classify(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) => classify_status(ae.code, &ae.message),
        other => ClusterError::Transient(other.to_string()),
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

/// `ClusterClient` backed by a kube `Client`. Discovery results are cached per GVK.
pub struct KubeCluster {
    client: Client,
    field_manager: String,
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: "keel".to_string(), resources: Mutex::new(FxHashMap::default()) }
    }

    /// Client from the ambient kubeconfig / in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn with_field_manager(mut self, name: &str) -> Self {
        self.field_manager = name.to_string();
        self
    }

    async fn resource(&self, kind: &str) -> Result<(ApiResource, bool), ClusterError> {
        let mut cache = self.resources.lock().await;
        if let Some(hit) = cache.get(kind) {
            return Ok(hit.clone());
        }
        let gvk = parse_gvk_key(kind).map_err(|e| ClusterError::Rejected(e.to_string()))?;
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(classify)?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let key = if ar.group.is_empty() {
                    format!("{}/{}", ar.version, ar.kind)
                } else {
                    format!("{}/{}/{}", ar.group, ar.version, ar.kind)
                };
                cache.insert(key, (ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
        debug!(kinds = cache.len(), "discovery cache refreshed");
        cache
            .get(kind)
            .cloned()
            .ok_or_else(|| ClusterError::Rejected(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
    }

    async fn api(&self, kind: &str, namespace: Option<&str>) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        let (ar, namespaced) = self.resource(kind).await?;
        let api = if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => return Err(ClusterError::Rejected("namespace required for namespaced kind".into())),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok((api, ar))
    }
}

fn to_remote(obj: &DynamicObject) -> Result<Json, ClusterError> {
    serde_json::to_value(obj)
        .map(keel_apply::strip_noisy)
        .map_err(|e| ClusterError::Transient(format!("serializing DynamicObject: {}", e)))
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn create(&self, kind: &str, namespace: Option<&str>, spec: &Spec) -> Result<Json, ClusterError> {
        let (api, ar) = self.api(kind, namespace).await?;
        let mut body = spec.clone();
        body.insert("apiVersion".into(), Json::String(ar.api_version.clone()));
        body.insert("kind".into(), Json::String(ar.kind.clone()));
        let obj: DynamicObject = serde_json::from_value(Json::Object(body))
            .map_err(|e| ClusterError::Rejected(format!("spec is not a valid object: {}", e)))?;
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let created = api.create(&pp, &obj).await.map_err(classify)?;
        counter!("kube_create_total", 1u64);
        to_remote(&created)
    }

    async fn update(&self, kind: &str, namespace: Option<&str>, name: &str, fields: &Spec) -> Result<Json, ClusterError> {
        let (api, _) = self.api(kind, namespace).await?;
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let patched = api.patch(name, &pp, &Patch::Merge(&Json::Object(fields.clone()))).await.map_err(classify)?;
        counter!("kube_patch_total", 1u64);
        to_remote(&patched)
    }

    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        let (api, _) = self.api(kind, namespace).await?;
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                counter!("kube_delete_total", 1u64);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Option<Json>, ClusterError> {
        let (api, _) = self.api(kind, namespace).await?;
        match api.get_opt(name).await.map_err(classify)? {
            Some(obj) => Ok(Some(to_remote(&obj)?)),
            None => Ok(None),
        }
    }
}

fn event_for(kind_key: &str, obj: &DynamicObject, deleted: bool) -> Option<RemoteEvent> {
    let name = obj.metadata.name.as_deref()?;
    let id = NodeId::new(kind_key, obj.metadata.namespace.as_deref(), name);
    let object = if deleted { None } else { serde_json::to_value(obj).ok().map(keel_apply::strip_noisy) };
    Some(RemoteEvent { id, object })
}

/// List+watch one kind and forward every change as a `RemoteEvent`. Returns
/// when the receiver goes away or the watch stream ends.
pub async fn watch_remote(client: Client, kind_key: &str, namespace: Option<&str>, tx: mpsc::Sender<RemoteEvent>) -> Result<()> {
    let hub = KubeCluster::new(client.clone());
    let (ar, namespaced) = hub.resource(kind_key).await.map_err(|e| anyhow!("{}", e))?;
    let api: Api<DynamicObject> = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = %kind_key, ns = ?namespace, "remote watcher started");
    while let Some(ev) = stream.try_next().await? {
        let events: Vec<RemoteEvent> = match ev {
            Event::Applied(o) => event_for(kind_key, &o, false).into_iter().collect(),
            Event::Deleted(o) => event_for(kind_key, &o, true).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list.iter().filter_map(|o| event_for(kind_key, o, false)).collect()
            }
        };
        for e in events {
            if tx.send(e).await.is_err() {
                debug!(kind = %kind_key, "remote event receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(kind = %kind_key, "watcher stream ended");
    Ok(())
}
