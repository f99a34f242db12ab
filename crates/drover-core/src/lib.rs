//! Drover core types: broker resource model, config fingerprinting, and
//! workload status projection.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Resource kinds the reconciliation core recognizes.
///
/// Declaration order is apply order: configuration and services converge
/// before the workload set that mounts them, routes last. `Ord` derives from
/// this, so kind-keyed maps iterate the same way on every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    ConfigMap,
    Secret,
    Service,
    StatefulSet,
    Route,
    OpenShiftApiServer,
}

impl ResourceKind {
    /// Kinds a broker pass reconciles, in apply order. The capability kind
    /// is probed, never reconciled.
    pub const MANAGED: [ResourceKind; 5] = [
        ResourceKind::ConfigMap,
        ResourceKind::Secret,
        ResourceKind::Service,
        ResourceKind::StatefulSet,
        ResourceKind::Route,
    ];

    /// Kind string as the platform API serves it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Route => "Route",
            ResourceKind::OpenShiftApiServer => "OpenShiftAPIServer",
        }
    }

    /// API group the kind is served under; empty for the core group.
    pub fn group(&self) -> &'static str {
        match self {
            ResourceKind::ConfigMap | ResourceKind::Secret | ResourceKind::Service => "",
            ResourceKind::StatefulSet => "apps",
            ResourceKind::Route => "route.openshift.io",
            ResourceKind::OpenShiftApiServer => "operator.openshift.io",
        }
    }

    pub fn version(&self) -> &'static str {
        "v1"
    }

    /// `group/version` as it appears in object manifests.
    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::ConfigMap | ResourceKind::Secret | ResourceKind::Service => "v1",
            ResourceKind::StatefulSet => "apps/v1",
            ResourceKind::Route => "route.openshift.io/v1",
            ResourceKind::OpenShiftApiServer => "operator.openshift.io/v1",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deployable platform resource with its typed payload.
///
/// The four native kinds carry API structs; the two platform-specific kinds
/// are served as dynamic objects since the core API types do not model them.
#[derive(Debug, Clone)]
pub enum ResourceObject {
    ConfigMap(ConfigMap),
    Secret(Secret),
    Service(Service),
    StatefulSet(StatefulSet),
    Route(DynamicObject),
    OpenShiftApiServer(DynamicObject),
}

impl ResourceObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceObject::ConfigMap(_) => ResourceKind::ConfigMap,
            ResourceObject::Secret(_) => ResourceKind::Secret,
            ResourceObject::Service(_) => ResourceKind::Service,
            ResourceObject::StatefulSet(_) => ResourceKind::StatefulSet,
            ResourceObject::Route(_) => ResourceKind::Route,
            ResourceObject::OpenShiftApiServer(_) => ResourceKind::OpenShiftApiServer,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ResourceObject::ConfigMap(o) => &o.metadata,
            ResourceObject::Secret(o) => &o.metadata,
            ResourceObject::Service(o) => &o.metadata,
            ResourceObject::StatefulSet(o) => &o.metadata,
            ResourceObject::Route(o) | ResourceObject::OpenShiftApiServer(o) => &o.metadata,
        }
    }

    /// Object name; empty when metadata carries none. Resources pair across
    /// the desired and observed sets by `(kind, name)`.
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }
}

impl From<ConfigMap> for ResourceObject {
    fn from(o: ConfigMap) -> Self {
        ResourceObject::ConfigMap(o)
    }
}

impl From<Secret> for ResourceObject {
    fn from(o: Secret) -> Self {
        ResourceObject::Secret(o)
    }
}

impl From<Service> for ResourceObject {
    fn from(o: Service) -> Self {
        ResourceObject::Service(o)
    }
}

impl From<StatefulSet> for ResourceObject {
    fn from(o: StatefulSet) -> Self {
        ResourceObject::StatefulSet(o)
    }
}

/// Resources that should exist for one broker, in factory order.
pub type DesiredSet = Vec<ResourceObject>;

/// Resources that do exist, bucketed per kind; each bucket comes from one
/// platform list call.
pub type ObservedSet = BTreeMap<ResourceKind, Vec<ResourceObject>>;

/// Per-kind difference between the observed and desired sets.
#[derive(Debug, Clone, Default)]
pub struct ResourceDelta {
    pub added: Vec<ResourceObject>,
    pub updated: Vec<ResourceObject>,
    pub removed: Vec<ResourceObject>,
}

impl ResourceDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Number of mutations the delta will issue.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

pub type KindDeltas = BTreeMap<ResourceKind, ResourceDelta>;

// ---- config fingerprint ----

/// Annotation under which the config fingerprint is stamped on workloads.
pub const FINGERPRINT_ANNOTATION: &str = "drover.io/config-fingerprint";

/// Stamp a config digest on a workload set and its pod template. The
/// template annotation makes a config change roll the pods; the object
/// annotation lets a pass read the last applied digest without unpacking
/// config payloads.
pub fn stamp_fingerprint(set: &mut StatefulSet, digest: &str) {
    set.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(FINGERPRINT_ANNOTATION.to_string(), digest.to_string());
    if let Some(spec) = set.spec.as_mut() {
        spec.template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(FINGERPRINT_ANNOTATION.to_string(), digest.to_string());
    }
}

/// Order-sensitive SHA-256 hex digest over configuration property strings.
///
/// Each property is fed to the hasher followed by a separator byte, so both
/// element order and element boundaries matter. Appending an entry changes
/// the digest; restoring the exact previous sequence restores it. The empty
/// sequence has a stable digest and the function never fails.
pub fn config_fingerprint<S: AsRef<str>>(properties: &[S]) -> String {
    let mut hasher = Sha256::new();
    for p in properties {
        hasher.update(p.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

// ---- status projection ----

/// Per-pod readiness buckets projected from one workload set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: Vec<String>,
    pub starting: Vec<String>,
    pub stopped: Vec<String>,
}

impl ReadinessReport {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.starting.is_empty() && self.stopped.is_empty()
    }
}

/// Project the replica counters of a workload set onto named pod buckets.
///
/// Pod identifiers follow the stable `<name>-<ordinal>` scheme. The pod count
/// is the larger of spec and status replicas, so scale-up keeps not-yet
/// scheduled pods visible as stopped and scale-down keeps surplus pods
/// visible until they terminate. A status of zero replicas reports the bare
/// workload name as stopped: the set exists but nothing was scheduled.
pub fn project_statefulset(set: &StatefulSet) -> ReadinessReport {
    let name = set.metadata.name.as_deref().unwrap_or("");
    let spec_replicas = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let status_replicas = set.status.as_ref().map(|s| s.replicas).unwrap_or(0);
    let ready_replicas = set
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    let mut report = ReadinessReport::default();
    if status_replicas == 0 {
        report.stopped.push(name.to_string());
        return report;
    }
    for i in 0..spec_replicas.max(status_replicas) {
        let pod = format!("{name}-{i}");
        if i < ready_replicas {
            report.ready.push(pod);
        } else if i < status_replicas {
            report.starting.push(pod);
        } else {
            report.stopped.push(pod);
        }
    }
    report
}

// ---- JSON codec ----

pub mod codec {
    //! JSON helpers for status blobs and config payloads.

    use serde::de::DeserializeOwned;
    use serde::Serialize;

    pub fn to_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
        serde_json::to_string(value)
    }

    pub fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

pub mod prelude {
    pub use super::{
        config_fingerprint, project_statefulset, stamp_fingerprint, DesiredSet, KindDeltas,
        ObservedSet, ReadinessReport, ResourceDelta, ResourceKind, ResourceObject,
        FINGERPRINT_ANNOTATION,
    };
}
