//! Per-broker reconcile state and the level-triggered convergence pass.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Instant;

use drover_compare::Comparator;
use drover_core::{
    config_fingerprint, DesiredSet, KindDeltas, ObservedSet, ResourceDelta, ResourceKind,
    ResourceObject,
};
use drover_platform::{PlatformApi, PlatformError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Identity of one broker deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerRef {
    pub name: String,
    pub namespace: String,
}

impl BrokerRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for BrokerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Platform action a delta entry maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Create,
    Update,
    Delete,
}

impl Mutation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mutation::Create => "create",
            Mutation::Update => "update",
            Mutation::Delete => "delete",
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One platform call that failed, attributed to kind, action, and name.
#[derive(Debug, Error)]
#[error("{action} {kind}/{name}: {source}")]
pub struct KindFailure {
    pub kind: ResourceKind,
    pub action: Mutation,
    pub name: String,
    #[source]
    pub source: PlatformError,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// One or more kinds failed to apply; the remaining kinds went through.
    #[error("reconcile {broker}: {n} kind(s) failed to apply", n = .failures.len())]
    Apply {
        broker: BrokerRef,
        failures: Vec<KindFailure>,
    },

    #[error("list {kind} for {broker}: {source}")]
    Observe {
        broker: BrokerRef,
        kind: ResourceKind,
        #[source]
        source: PlatformError,
    },
}

impl ReconcileError {
    /// Kinds that failed during the pass.
    pub fn failed_kinds(&self) -> Vec<ResourceKind> {
        match self {
            ReconcileError::Apply { failures, .. } => failures.iter().map(|f| f.kind).collect(),
            ReconcileError::Observe { kind, .. } => vec![*kind],
        }
    }
}

/// Desired and observed resources for one broker, plus the comparator that
/// judges drift.
///
/// One pass owns the state mutably; nothing is shared and nothing carries
/// over between passes except the sets themselves. Repeating a pass over
/// unchanged sets recomputes the identical delta.
pub struct BrokerState {
    broker: BrokerRef,
    desired: DesiredSet,
    observed: ObservedSet,
    comparator: Comparator,
}

impl BrokerState {
    pub fn new(broker: BrokerRef) -> Self {
        Self::with_comparator(broker, Comparator::new())
    }

    /// State with a caller-tuned comparator (per-kind overrides installed).
    pub fn with_comparator(broker: BrokerRef, comparator: Comparator) -> Self {
        Self {
            broker,
            desired: DesiredSet::new(),
            observed: ObservedSet::new(),
            comparator,
        }
    }

    pub fn broker(&self) -> &BrokerRef {
        &self.broker
    }

    pub fn desired(&self) -> &[ResourceObject] {
        &self.desired
    }

    pub fn observed(&self) -> &ObservedSet {
        &self.observed
    }

    /// Replace the desired set wholesale. Factories recompute it every pass;
    /// nothing merges.
    pub fn set_desired(&mut self, resources: DesiredSet) {
        self.desired = resources;
    }

    /// Replace one kind's observed bucket, fed from one platform list call.
    pub fn set_observed(&mut self, kind: ResourceKind, resources: Vec<ResourceObject>) {
        self.observed.insert(kind, resources);
    }

    /// List `kinds` through the platform API into the observed buckets.
    pub async fn observe(
        &mut self,
        api: &dyn PlatformApi,
        kinds: &[ResourceKind],
        label_selector: Option<&str>,
    ) -> Result<(), ReconcileError> {
        for &kind in kinds {
            let bucket = api
                .list(kind, label_selector)
                .await
                .map_err(|source| ReconcileError::Observe {
                    broker: self.broker.clone(),
                    kind,
                    source,
                })?;
            self.set_observed(kind, bucket);
        }
        Ok(())
    }

    /// One level-triggered convergence pass: recompute the full delta from
    /// the current sets and apply it, creates before updates before deletes
    /// within each kind.
    ///
    /// A failed platform call stops further mutations for that kind only;
    /// the remaining kinds still apply. The error attributes every failure
    /// to its kind, action, and resource name.
    pub async fn reconcile(&mut self, api: &dyn PlatformApi) -> Result<KindDeltas, ReconcileError> {
        let start = Instant::now();
        counter!("reconcile_attempts", 1u64);

        let deltas = self.comparator.diff(&self.observed, &self.desired);
        let mut failures = Vec::new();
        for (kind, delta) in &deltas {
            if delta.is_empty() {
                continue;
            }
            debug!(
                broker = %self.broker,
                kind = %kind,
                added = delta.added.len(),
                updated = delta.updated.len(),
                removed = delta.removed.len(),
                "applying delta"
            );
            if let Err(failure) = apply_delta(api, *kind, delta).await {
                warn!(broker = %self.broker, kind = %kind, error = %failure, "kind aborted; continuing with the rest");
                counter!("reconcile_kind_err", 1u64);
                failures.push(failure);
            }
        }

        histogram!("reconcile_pass_ms", start.elapsed().as_secs_f64() * 1000.0);
        if failures.is_empty() {
            counter!("reconcile_ok", 1u64);
            Ok(deltas)
        } else {
            counter!("reconcile_err", 1u64);
            Err(ReconcileError::Apply {
                broker: self.broker.clone(),
                failures,
            })
        }
    }
}

async fn apply_delta(
    api: &dyn PlatformApi,
    kind: ResourceKind,
    delta: &ResourceDelta,
) -> Result<(), KindFailure> {
    let fail = |action: Mutation, object: &ResourceObject, source: PlatformError| KindFailure {
        kind,
        action,
        name: object.name().to_string(),
        source,
    };
    for object in &delta.added {
        api.create(object)
            .await
            .map_err(|e| fail(Mutation::Create, object, e))?;
        counter!("resource_creates", 1u64);
    }
    for object in &delta.updated {
        api.update(object)
            .await
            .map_err(|e| fail(Mutation::Update, object, e))?;
        counter!("resource_updates", 1u64);
    }
    for object in &delta.removed {
        api.delete(object)
            .await
            .map_err(|e| fail(Mutation::Delete, object, e))?;
        counter!("resource_deletes", 1u64);
    }
    Ok(())
}

// ---- config sources ----

/// Contributor of configuration properties for broker fingerprinting.
///
/// The embedding operator registers sources once; each pass consults them in
/// registration order.
pub trait ConfigSource: Send + Sync {
    /// Whether this source contributes to the given broker at all.
    fn applies_to(&self, broker: &BrokerRef) -> bool;

    /// Ordered `key=value` property strings for the broker.
    fn properties(&self, broker: &BrokerRef) -> Vec<String>;
}

/// Fingerprint of everything the applicable sources contribute, in
/// registration order. The digest is stamped on the workload under
/// [`drover_core::FINGERPRINT_ANNOTATION`]; a changed digest is config drift.
pub fn fingerprint_from_sources(broker: &BrokerRef, sources: &[&dyn ConfigSource]) -> String {
    let mut properties = Vec::new();
    for source in sources {
        if source.applies_to(broker) {
            properties.extend(source.properties(broker));
        }
    }
    config_fingerprint(&properties)
}
