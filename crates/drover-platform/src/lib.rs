//! Platform access for the reconciliation core: a narrow client trait, its
//! kube-backed implementation, capability discovery, and process knobs.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use drover_core::{ResourceKind, ResourceObject};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Discovery, Resource};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Field manager every server-side apply in this operator writes under.
pub const FIELD_MANAGER: &str = "drover";

pub type Result<T> = std::result::Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform api: {0}")]
    Kube(#[from] kube::Error),

    #[error("{kind} object carries no metadata.name")]
    MissingName { kind: ResourceKind },
}

/// Narrow client surface the reconcile pass needs. The real implementation
/// talks to the platform; tests substitute a recorder.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// List every object of `kind` in the broker namespace, optionally
    /// filtered by a label selector.
    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: Option<&str>,
    ) -> Result<Vec<ResourceObject>>;

    async fn create(&self, object: &ResourceObject) -> Result<()>;

    /// Write the desired payload via server-side apply under
    /// [`FIELD_MANAGER`], taking ownership of conflicting fields.
    async fn update(&self, object: &ResourceObject) -> Result<()>;

    /// Delete by name. An object that is already gone counts as deleted.
    async fn delete(&self, object: &ResourceObject) -> Result<()>;
}

/// Kube-backed [`PlatformApi`] bound to one namespace.
///
/// Constructed once at startup and handed to collaborators; there is no
/// process-global handle.
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
    namespace: String,
}

impl KubeApi {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Raw client handle for collaborators outside the reconcile core.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn typed<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn dynamic(&self, kind: ResourceKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource_for(kind))
    }

    async fn list_typed<K, F>(&self, lp: &ListParams, wrap: F) -> Result<Vec<ResourceObject>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
        F: Fn(K) -> ResourceObject + Send,
    {
        let items = self.typed::<K>().list(lp).await?.items;
        Ok(items.into_iter().map(wrap).collect())
    }

    async fn create_typed<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        self.typed::<K>().create(&PostParams::default(), obj).await?;
        Ok(())
    }

    async fn update_typed<K>(&self, kind: ResourceKind, name: &str, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        if name.is_empty() {
            return Err(PlatformError::MissingName { kind });
        }
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.typed::<K>().patch(name, &pp, &Patch::Apply(obj)).await?;
        Ok(())
    }

    async fn delete_typed<K>(&self, kind: ResourceKind, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        if name.is_empty() {
            return Err(PlatformError::MissingName { kind });
        }
        absorb_not_found(
            kind,
            name,
            self.typed::<K>().delete(name, &DeleteParams::default()).await,
        )
    }
}

#[async_trait]
impl PlatformApi for KubeApi {
    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: Option<&str>,
    ) -> Result<Vec<ResourceObject>> {
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        match kind {
            ResourceKind::ConfigMap => self.list_typed(&lp, ResourceObject::ConfigMap).await,
            ResourceKind::Secret => self.list_typed(&lp, ResourceObject::Secret).await,
            ResourceKind::Service => self.list_typed(&lp, ResourceObject::Service).await,
            ResourceKind::StatefulSet => self.list_typed(&lp, ResourceObject::StatefulSet).await,
            ResourceKind::Route | ResourceKind::OpenShiftApiServer => {
                let wrap: fn(DynamicObject) -> ResourceObject = match kind {
                    ResourceKind::Route => ResourceObject::Route,
                    _ => ResourceObject::OpenShiftApiServer,
                };
                let items = self.dynamic(kind).list(&lp).await?.items;
                Ok(items.into_iter().map(wrap).collect())
            }
        }
    }

    async fn create(&self, object: &ResourceObject) -> Result<()> {
        match object {
            ResourceObject::ConfigMap(o) => self.create_typed(o).await,
            ResourceObject::Secret(o) => self.create_typed(o).await,
            ResourceObject::Service(o) => self.create_typed(o).await,
            ResourceObject::StatefulSet(o) => self.create_typed(o).await,
            ResourceObject::Route(o) | ResourceObject::OpenShiftApiServer(o) => {
                self.dynamic(object.kind())
                    .create(&PostParams::default(), o)
                    .await?;
                Ok(())
            }
        }
    }

    async fn update(&self, object: &ResourceObject) -> Result<()> {
        let kind = object.kind();
        let name = object.name();
        match object {
            ResourceObject::ConfigMap(o) => self.update_typed(kind, name, o).await,
            ResourceObject::Secret(o) => self.update_typed(kind, name, o).await,
            ResourceObject::Service(o) => self.update_typed(kind, name, o).await,
            ResourceObject::StatefulSet(o) => self.update_typed(kind, name, o).await,
            ResourceObject::Route(o) | ResourceObject::OpenShiftApiServer(o) => {
                if name.is_empty() {
                    return Err(PlatformError::MissingName { kind });
                }
                let pp = PatchParams::apply(FIELD_MANAGER).force();
                self.dynamic(kind).patch(name, &pp, &Patch::Apply(o)).await?;
                Ok(())
            }
        }
    }

    async fn delete(&self, object: &ResourceObject) -> Result<()> {
        let kind = object.kind();
        let name = object.name();
        match kind {
            ResourceKind::ConfigMap => self.delete_typed::<ConfigMap>(kind, name).await,
            ResourceKind::Secret => self.delete_typed::<Secret>(kind, name).await,
            ResourceKind::Service => self.delete_typed::<Service>(kind, name).await,
            ResourceKind::StatefulSet => self.delete_typed::<StatefulSet>(kind, name).await,
            ResourceKind::Route | ResourceKind::OpenShiftApiServer => {
                if name.is_empty() {
                    return Err(PlatformError::MissingName { kind });
                }
                absorb_not_found(
                    kind,
                    name,
                    self.dynamic(kind).delete(name, &DeleteParams::default()).await,
                )
            }
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

fn absorb_not_found<T>(kind: ResourceKind, name: &str, res: kube::Result<T>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => {
            debug!(kind = %kind, name, "delete target already gone");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// ApiResource for the kinds served as dynamic objects.
pub fn api_resource_for(kind: ResourceKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.as_str());
    ApiResource::from_gvk(&gvk)
}

// ---- capability discovery ----

/// What the platform serves, probed once at startup. Resource factories
/// consult this before emitting routing-endpoint objects at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCaps {
    /// The routing-endpoint group (`route.openshift.io`) is served.
    pub routes: bool,
    /// The api-server configuration group (`operator.openshift.io`) is served.
    pub openshift: bool,
}

/// Walk the discovery endpoint and record which platform-specific kinds are
/// served.
pub async fn discover_caps(client: Client) -> Result<PlatformCaps> {
    let discovery = Discovery::new(client).run().await?;
    let mut caps = PlatformCaps::default();
    for group in discovery.groups() {
        for (ar, _) in group.recommended_resources() {
            if ar.group == ResourceKind::Route.group() && ar.kind == ResourceKind::Route.as_str() {
                caps.routes = true;
            }
            if ar.group == ResourceKind::OpenShiftApiServer.group()
                && ar.kind == ResourceKind::OpenShiftApiServer.as_str()
            {
                caps.openshift = true;
            }
        }
    }
    debug!(routes = caps.routes, openshift = caps.openshift, "platform capabilities");
    Ok(caps)
}

// ---- process knobs ----

/// Default resync period: the slow safety net behind the level-triggered
/// pass.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60 * 60);

/// Resync period from `DROVER_RESYNC_PERIOD` (humantime grammar, e.g. `10h`
/// or `30m`). Absent or unparseable values fall back to the default.
pub fn resync_period() -> Duration {
    resync_from(std::env::var("DROVER_RESYNC_PERIOD").ok().as_deref())
}

fn resync_from(raw: Option<&str>) -> Duration {
    raw.and_then(|s| humantime::parse_duration(s.trim()).ok())
        .unwrap_or(DEFAULT_RESYNC_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resync_knob_falls_back_to_default() {
        assert_eq!(resync_from(None), DEFAULT_RESYNC_PERIOD);
        assert_eq!(resync_from(Some("never")), DEFAULT_RESYNC_PERIOD);
        assert_eq!(resync_from(Some("")), DEFAULT_RESYNC_PERIOD);
        assert_eq!(resync_from(Some("30m")), Duration::from_secs(30 * 60));
        assert_eq!(resync_from(Some("10h")), DEFAULT_RESYNC_PERIOD);
    }

    #[test]
    fn dynamic_kinds_resolve_to_their_served_groups() {
        let route = api_resource_for(ResourceKind::Route);
        assert_eq!(route.group, "route.openshift.io");
        assert_eq!(route.version, "v1");
        assert_eq!(route.kind, "Route");
        assert_eq!(route.plural, "routes");

        let apiserver = api_resource_for(ResourceKind::OpenShiftApiServer);
        assert_eq!(apiserver.api_version, "operator.openshift.io/v1");
        assert_eq!(apiserver.plural, "openshiftapiservers");
    }

    #[test]
    fn deleting_an_absent_object_is_success() {
        let gone = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "routes \"console\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(is_not_found(&gone));
        assert!(absorb_not_found::<()>(ResourceKind::Route, "console", Err(gone)).is_ok());

        let denied = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert!(absorb_not_found::<()>(ResourceKind::Route, "console", Err(denied)).is_err());
    }

    #[test]
    fn missing_name_is_reported_with_its_kind() {
        let err = PlatformError::MissingName {
            kind: ResourceKind::Service,
        };
        assert!(err.to_string().contains("Service"));
    }
}
