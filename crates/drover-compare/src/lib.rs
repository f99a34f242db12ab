//! Desired-vs-observed resource differencing with pluggable equality.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use drover_core::{KindDeltas, ObservedSet, ResourceDelta, ResourceKind, ResourceObject};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaim};
use serde_json::Value as Json;

pub mod quantity {
    //! Numeric comparison of compute-resource quantities.
    //!
    //! The platform accepts the same value in many spellings (`1` vs `1000m`,
    //! `1Gi` vs `1024Mi`); textual equality over those spellings would report
    //! drift where none exists. Parsing is exact: an integer mantissa with a
    //! decimal and a binary exponent, so no floating-point rounding can make
    //! two different values compare equal.

    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{ResourceRequirements, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    /// Resource names that participate in the comparison. Anything else
    /// (hugepages, device plugins) is ignored entirely.
    pub const COMPARED_RESOURCES: [&str; 4] = ["cpu", "memory", "storage", "ephemeral-storage"];

    /// Exact value of a quantity: `mantissa * 10^exp10 * 2^exp2`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Parsed {
        mantissa: i128,
        exp10: i32,
        exp2: u32,
    }

    fn parse(text: &str) -> Option<Parsed> {
        let s = text.trim();
        let (negative, s) = match s.as_bytes().first()? {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };
        let body_len = s
            .bytes()
            .take_while(|b| b.is_ascii_digit() || *b == b'.')
            .count();
        let (body, suffix) = s.split_at(body_len);

        let mut mantissa: i128 = 0;
        let mut digits = 0usize;
        let mut frac_digits: i32 = 0;
        let mut seen_dot = false;
        for b in body.bytes() {
            if b == b'.' {
                if seen_dot {
                    return None;
                }
                seen_dot = true;
                continue;
            }
            mantissa = mantissa.checked_mul(10)?.checked_add(i128::from(b - b'0'))?;
            digits += 1;
            if seen_dot {
                frac_digits += 1;
            }
        }
        if digits == 0 {
            return None;
        }

        let mut exp10 = -frac_digits;
        let mut exp2 = 0u32;
        match suffix {
            "" => {}
            "m" => exp10 -= 3,
            "k" => exp10 += 3,
            "M" => exp10 += 6,
            "G" => exp10 += 9,
            "T" => exp10 += 12,
            "P" => exp10 += 15,
            "E" => exp10 += 18,
            "Ki" => exp2 = 10,
            "Mi" => exp2 = 20,
            "Gi" => exp2 = 30,
            "Ti" => exp2 = 40,
            "Pi" => exp2 = 50,
            "Ei" => exp2 = 60,
            exp => {
                // scientific notation; bare "E" (exa) was handled above
                let first = exp.chars().next()?;
                if first != 'e' && first != 'E' {
                    return None;
                }
                exp10 = exp10.checked_add(exp[1..].parse::<i32>().ok()?)?;
            }
        }
        if negative {
            mantissa = -mantissa;
        }
        Some(Parsed { mantissa, exp10, exp2 })
    }

    /// Fold trailing decimal zeros into the exponent so equal values land on
    /// the same representation where possible.
    fn canonicalize(p: &mut Parsed) {
        while p.mantissa != 0 && p.mantissa % 10 == 0 {
            p.mantissa /= 10;
            p.exp10 += 1;
        }
    }

    fn eq_exact(mut a: Parsed, mut b: Parsed) -> bool {
        canonicalize(&mut a);
        canonicalize(&mut b);
        if a.mantissa == 0 || b.mantissa == 0 {
            return a.mantissa == 0 && b.mantissa == 0;
        }
        // Shift the larger-exponent side down onto the other. Overflow of
        // i128 means the magnitudes cannot match: canonical mantissas carry
        // no trailing zeros, so the factor cannot cancel.
        let mut lhs = a.mantissa;
        let mut rhs = b.mantissa;
        let d10 = a.exp10 - b.exp10;
        let scaled10 = if d10 >= 0 { &mut lhs } else { &mut rhs };
        match 10i128
            .checked_pow(d10.unsigned_abs())
            .and_then(|f| scaled10.checked_mul(f))
        {
            Some(v) => *scaled10 = v,
            None => return false,
        }
        let d2 = i64::from(a.exp2) - i64::from(b.exp2);
        let scaled2 = if d2 >= 0 { &mut lhs } else { &mut rhs };
        match 1i128
            .checked_shl(d2.unsigned_abs() as u32)
            .and_then(|f| scaled2.checked_mul(f))
        {
            Some(v) => *scaled2 = v,
            None => return false,
        }
        lhs == rhs
    }

    /// Numeric equality of two quantity strings. Values that do not parse as
    /// quantities fall back to literal string comparison; never fails.
    pub fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
        match (parse(&a.0), parse(&b.0)) {
            (Some(x), Some(y)) => eq_exact(x, y),
            _ => a.0 == b.0,
        }
    }

    fn maps_equal(
        a: Option<&BTreeMap<String, Quantity>>,
        b: Option<&BTreeMap<String, Quantity>>,
    ) -> bool {
        for name in COMPARED_RESOURCES {
            match (a.and_then(|m| m.get(name)), b.and_then(|m| m.get(name))) {
                (Some(x), Some(y)) => {
                    if !quantities_equal(x, y) {
                        return false;
                    }
                }
                (None, None) => {}
                // present on one side only is a real difference
                _ => return false,
            }
        }
        true
    }

    /// Compare container requirements: limits first, then requests. A missing
    /// requirements struct is equivalent to empty maps.
    pub fn requirements_equal(a: Option<&ResourceRequirements>, b: Option<&ResourceRequirements>) -> bool {
        maps_equal(a.and_then(|r| r.limits.as_ref()), b.and_then(|r| r.limits.as_ref()))
            && maps_equal(
                a.and_then(|r| r.requests.as_ref()),
                b.and_then(|r| r.requests.as_ref()),
            )
    }

    /// Same comparison for the storage requirements of volume claim templates.
    pub fn volume_requirements_equal(
        a: Option<&VolumeResourceRequirements>,
        b: Option<&VolumeResourceRequirements>,
    ) -> bool {
        maps_equal(a.and_then(|r| r.limits.as_ref()), b.and_then(|r| r.limits.as_ref()))
            && maps_equal(
                a.and_then(|r| r.requests.as_ref()),
                b.and_then(|r| r.requests.as_ref()),
            )
    }

}

// ---- semantic equality ----

fn json_of(obj: &ResourceObject) -> Json {
    let v = match obj {
        ResourceObject::ConfigMap(o) => serde_json::to_value(o),
        ResourceObject::Secret(o) => serde_json::to_value(o),
        ResourceObject::Service(o) => serde_json::to_value(o),
        ResourceObject::StatefulSet(o) => serde_json::to_value(o),
        ResourceObject::Route(o) | ResourceObject::OpenShiftApiServer(o) => serde_json::to_value(o),
    };
    v.unwrap_or(Json::Null)
}

/// Drop server bookkeeping that changes without the object's intent
/// changing. Status is server-populated and never part of intent.
fn strip_volatile(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for key in [
            "managedFields",
            "resourceVersion",
            "uid",
            "generation",
            "creationTimestamp",
            "deletionTimestamp",
            "deletionGracePeriodSeconds",
            "selfLink",
        ] {
            meta.remove(key);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Take compute requirements out of the structural view; they compare
/// numerically instead (`quantity`), so spelling differences do not count.
fn strip_workload_requirements(v: &mut Json) {
    if let Some(pod) = v.pointer_mut("/spec/template/spec") {
        for key in ["containers", "initContainers"] {
            if let Some(items) = pod.get_mut(key).and_then(Json::as_array_mut) {
                for c in items {
                    if let Some(obj) = c.as_object_mut() {
                        obj.remove("resources");
                    }
                }
            }
        }
    }
    if let Some(templates) = v
        .pointer_mut("/spec/volumeClaimTemplates")
        .and_then(Json::as_array_mut)
    {
        for t in templates {
            if let Some(spec) = t.get_mut("spec").and_then(Json::as_object_mut) {
                spec.remove("resources");
            }
        }
    }
}

fn containers(set: &StatefulSet) -> &[Container] {
    set.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or(&[])
}

fn init_containers(set: &StatefulSet) -> &[Container] {
    set.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.init_containers.as_deref())
        .unwrap_or(&[])
}

fn claim_templates(set: &StatefulSet) -> &[PersistentVolumeClaim] {
    set.spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.as_deref())
        .unwrap_or(&[])
}

fn workload_requirements_equal(a: &StatefulSet, b: &StatefulSet) -> bool {
    let (ca, cb) = (containers(a), containers(b));
    let (ia, ib) = (init_containers(a), init_containers(b));
    let (ta, tb) = (claim_templates(a), claim_templates(b));
    if ca.len() != cb.len() || ia.len() != ib.len() || ta.len() != tb.len() {
        return false;
    }
    for (x, y) in ca.iter().zip(cb).chain(ia.iter().zip(ib)) {
        if !quantity::requirements_equal(x.resources.as_ref(), y.resources.as_ref()) {
            return false;
        }
    }
    for (x, y) in ta.iter().zip(tb) {
        let rx = x.spec.as_ref().and_then(|s| s.resources.as_ref());
        let ry = y.spec.as_ref().and_then(|s| s.resources.as_ref());
        if !quantity::volume_requirements_equal(rx, ry) {
            return false;
        }
    }
    true
}

/// Default equality predicate: structural comparison of the JSON views with
/// volatile bookkeeping elided. Workload compute requirements are elided from
/// the structural view and compared numerically, so `"1"` vs `"1000m"` never
/// forces an update.
pub fn semantic_equals(a: &ResourceObject, b: &ResourceObject) -> bool {
    if let (ResourceObject::StatefulSet(x), ResourceObject::StatefulSet(y)) = (a, b) {
        if !workload_requirements_equal(x, y) {
            return false;
        }
        let mut va = strip_volatile(json_of(a));
        let mut vb = strip_volatile(json_of(b));
        strip_workload_requirements(&mut va);
        strip_workload_requirements(&mut vb);
        return va == vb;
    }
    strip_volatile(json_of(a)) == strip_volatile(json_of(b))
}

// ---- comparator ----

type EqualsFn = Box<dyn Fn(&ResourceObject, &ResourceObject) -> bool + Send + Sync>;

/// Diff engine between the observed and desired resource sets.
///
/// Equality is pluggable: a default predicate plus per-kind overrides, so a
/// kind with platform-assigned spec fields (for example cluster IPs on
/// services) can tolerate them without loosening every other kind.
pub struct Comparator {
    default_eq: EqualsFn,
    overrides: BTreeMap<ResourceKind, EqualsFn>,
}

impl Default for Comparator {
    fn default() -> Self {
        Self::new()
    }
}

impl Comparator {
    /// Comparator with `semantic_equals` as the default predicate.
    pub fn new() -> Self {
        Self::with_default(semantic_equals)
    }

    /// Comparator with a caller-supplied default predicate.
    pub fn with_default<F>(eq: F) -> Self
    where
        F: Fn(&ResourceObject, &ResourceObject) -> bool + Send + Sync + 'static,
    {
        Self {
            default_eq: Box::new(eq),
            overrides: BTreeMap::new(),
        }
    }

    /// Install an equality override for one kind. A later registration for
    /// the same kind replaces the earlier one.
    pub fn register<F>(&mut self, kind: ResourceKind, eq: F)
    where
        F: Fn(&ResourceObject, &ResourceObject) -> bool + Send + Sync + 'static,
    {
        self.overrides.insert(kind, Box::new(eq));
    }

    fn equals(&self, kind: ResourceKind, a: &ResourceObject, b: &ResourceObject) -> bool {
        match self.overrides.get(&kind) {
            Some(eq) => eq(a, b),
            None => (self.default_eq)(a, b),
        }
    }

    /// Per-kind deltas between what exists and what should exist.
    ///
    /// Resources pair by name within their kind: desired names absent from
    /// the observed bucket are added, paired-but-unequal resources are
    /// updated (the desired payload is carried), observed names no desired
    /// resource claims are removed. Every kind present in either input gets
    /// an entry, even an empty one. Pure: neither input is mutated, and
    /// identical inputs yield identical deltas on every call.
    pub fn diff(&self, observed: &ObservedSet, desired: &[ResourceObject]) -> KindDeltas {
        let mut desired_by_kind: BTreeMap<ResourceKind, Vec<&ResourceObject>> = BTreeMap::new();
        for obj in desired {
            desired_by_kind.entry(obj.kind()).or_default().push(obj);
        }
        let mut kinds: BTreeSet<ResourceKind> = observed.keys().copied().collect();
        kinds.extend(desired_by_kind.keys().copied());

        let mut deltas = KindDeltas::new();
        for kind in kinds {
            let bucket: &[ResourceObject] = observed.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
            let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(bucket.len());
            for (i, obj) in bucket.iter().enumerate() {
                by_name.insert(obj.name(), i);
            }
            let mut claimed = vec![false; bucket.len()];
            let mut delta = ResourceDelta::default();
            for obj in desired_by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[]) {
                match by_name.get(obj.name()) {
                    Some(&i) => {
                        claimed[i] = true;
                        if !self.equals(kind, &bucket[i], obj) {
                            delta.updated.push((*obj).clone());
                        }
                    }
                    None => delta.added.push((*obj).clone()),
                }
            }
            for (i, obj) in bucket.iter().enumerate() {
                if !claimed[i] {
                    delta.removed.push(obj.clone());
                }
            }
            deltas.insert(kind, delta);
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::{
        ConfigMap, PodSpec, PodTemplateSpec, ResourceRequirements, Service, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("brokers".to_string()),
            ..ObjectMeta::default()
        }
    }

    fn config_map(name: &str, data: &[(&str, &str)]) -> ResourceObject {
        ResourceObject::ConfigMap(ConfigMap {
            metadata: meta(name),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..ConfigMap::default()
        })
    }

    fn stateful_set(name: &str, replicas: i32, cpu_limit: Option<&str>) -> ResourceObject {
        let resources = cpu_limit.map(|cpu| ResourceRequirements {
            limits: Some([("cpu".to_string(), Quantity(cpu.to_string()))].into()),
            ..ResourceRequirements::default()
        });
        ResourceObject::StatefulSet(StatefulSet {
            metadata: meta(name),
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "broker".to_string(),
                            resources,
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                    ..PodTemplateSpec::default()
                },
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        })
    }

    fn service(name: &str, cluster_ip: Option<&str>) -> ResourceObject {
        ResourceObject::Service(Service {
            metadata: meta(name),
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(str::to_string),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        })
    }

    fn observed(objects: Vec<ResourceObject>) -> ObservedSet {
        let mut set = ObservedSet::new();
        for obj in objects {
            set.entry(obj.kind()).or_default().push(obj);
        }
        set
    }

    #[test]
    fn bookkeeping_churn_is_not_drift() {
        let desired = config_map("broker-props", &[("a", "1")]);
        let mut live = desired.clone();
        if let ResourceObject::ConfigMap(cm) = &mut live {
            cm.metadata.resource_version = Some("4242".to_string());
            cm.metadata.uid = Some("b1f1c2d3".to_string());
            cm.metadata.generation = Some(7);
        }
        assert!(semantic_equals(&live, &desired));
    }

    #[test]
    fn data_changes_are_drift() {
        let a = config_map("broker-props", &[("a", "1")]);
        let b = config_map("broker-props", &[("a", "2")]);
        assert!(!semantic_equals(&a, &b));
    }

    #[test]
    fn status_subtree_is_ignored() {
        let desired = stateful_set("ss", 2, None);
        let mut live = desired.clone();
        if let ResourceObject::StatefulSet(set) = &mut live {
            set.status = Some(k8s_openapi::api::apps::v1::StatefulSetStatus {
                replicas: 2,
                ready_replicas: Some(1),
                ..Default::default()
            });
        }
        assert!(semantic_equals(&live, &desired));
    }

    #[test]
    fn workload_quantity_spelling_is_not_drift() {
        let a = stateful_set("ss", 1, Some("1"));
        let b = stateful_set("ss", 1, Some("1000m"));
        assert!(semantic_equals(&a, &b));
    }

    #[test]
    fn workload_quantity_value_change_is_drift() {
        let a = stateful_set("ss", 1, Some("1"));
        let b = stateful_set("ss", 1, Some("2"));
        assert!(!semantic_equals(&a, &b));
    }

    #[test]
    fn workload_replica_change_is_drift() {
        let a = stateful_set("ss", 1, Some("1"));
        let b = stateful_set("ss", 3, Some("1"));
        assert!(!semantic_equals(&a, &b));
    }

    #[test]
    fn one_added_one_updated_nothing_removed() {
        let live = observed(vec![stateful_set("ss", 1, None)]);
        let desired = vec![stateful_set("ss0", 1, None), stateful_set("ss", 2, None)];

        let deltas = Comparator::new().diff(&live, &desired);
        let delta = deltas
            .get(&ResourceKind::StatefulSet)
            .expect("workload kind compared");
        assert_eq!(delta.added.len(), 1, "ss0 is new");
        assert_eq!(delta.added[0].name(), "ss0");
        assert_eq!(delta.updated.len(), 1, "ss changed");
        assert_eq!(delta.updated[0].name(), "ss");
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn unclaimed_observed_resources_are_removed() {
        let live = observed(vec![
            config_map("keep", &[("a", "1")]),
            config_map("drop", &[("a", "1")]),
        ]);
        let desired = vec![config_map("keep", &[("a", "1")])];

        let deltas = Comparator::new().diff(&live, &desired);
        let delta = deltas.get(&ResourceKind::ConfigMap).expect("kind compared");
        assert!(delta.added.is_empty());
        assert!(delta.updated.is_empty());
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].name(), "drop");
    }

    #[test]
    fn unchanged_resources_land_in_no_bucket() {
        let live = observed(vec![config_map("same", &[("a", "1")])]);
        let desired = vec![config_map("same", &[("a", "1")])];

        let deltas = Comparator::new().diff(&live, &desired);
        let delta = deltas.get(&ResourceKind::ConfigMap).expect("kind entry exists");
        assert!(delta.is_empty(), "no bucket for an in-sync resource");
    }

    #[test]
    fn kinds_do_not_cross_pollinate() {
        let live = observed(vec![config_map("x", &[("a", "1")])]);
        let desired = vec![service("x", None)];

        let deltas = Comparator::new().diff(&live, &desired);
        assert_eq!(deltas[&ResourceKind::Service].added.len(), 1);
        assert_eq!(deltas[&ResourceKind::ConfigMap].removed.len(), 1);
    }

    #[test]
    fn added_resources_keep_desired_order() {
        let live = ObservedSet::new();
        let desired = vec![
            config_map("first", &[]),
            config_map("second", &[]),
            config_map("third", &[]),
        ];
        let deltas = Comparator::new().diff(&live, &desired);
        let names: Vec<&str> = deltas[&ResourceKind::ConfigMap]
            .added
            .iter()
            .map(|o| o.name())
            .collect();
        assert_eq!(names, ["first", "second", "third"]);
    }

    #[test]
    fn per_kind_override_wins_over_the_default() {
        let live = observed(vec![service("broker-hdls-svc", Some("10.0.0.7"))]);
        let desired = vec![service("broker-hdls-svc", None)];

        let mut comparator = Comparator::new();
        assert_eq!(
            comparator.diff(&live, &desired)[&ResourceKind::Service].updated.len(),
            1,
            "default predicate sees the assigned cluster ip as drift"
        );

        comparator.register(ResourceKind::Service, |a, b| {
            let strip_ip = |obj: &ResourceObject| {
                let mut v = match obj {
                    ResourceObject::Service(s) => serde_json::to_value(s).unwrap_or(Json::Null),
                    _ => Json::Null,
                };
                if let Some(spec) = v.get_mut("spec").and_then(Json::as_object_mut) {
                    spec.remove("clusterIP");
                    spec.remove("clusterIPs");
                }
                v
            };
            strip_ip(a) == strip_ip(b)
        });
        assert!(
            comparator.diff(&live, &desired)[&ResourceKind::Service].is_empty(),
            "override tolerates the platform-assigned ip"
        );
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let live = observed(vec![config_map("c", &[("a", "1")])]);
        let desired = vec![config_map("c", &[("a", "1")])];

        let mut comparator = Comparator::new();
        comparator.register(ResourceKind::ConfigMap, |_, _| false);
        comparator.register(ResourceKind::ConfigMap, |_, _| true);
        assert!(comparator.diff(&live, &desired)[&ResourceKind::ConfigMap].is_empty());
    }

    #[test]
    fn custom_default_predicate_applies_to_unregistered_kinds() {
        let live = observed(vec![config_map("c", &[("a", "1")])]);
        let desired = vec![config_map("c", &[("a", "1")])];

        let comparator = Comparator::with_default(|_, _| false);
        assert_eq!(
            comparator.diff(&live, &desired)[&ResourceKind::ConfigMap].updated.len(),
            1
        );
    }

    #[test]
    fn diff_is_idempotent_over_identical_inputs() {
        let live = observed(vec![
            stateful_set("ss", 1, Some("1")),
            config_map("props", &[("a", "1")]),
        ]);
        let desired = vec![
            stateful_set("ss", 2, Some("1")),
            config_map("props", &[("a", "2")]),
            service("svc", None),
        ];

        let comparator = Comparator::new();
        let first = comparator.diff(&live, &desired);
        let second = comparator.diff(&live, &desired);
        assert_eq!(
            format!("{first:?}"),
            format!("{second:?}"),
            "same inputs must produce byte-identical deltas"
        );
    }
}
