//! Shared types for remediate
//!
//! This crate contains the cluster model (pods, nodes, disruption budgets) and the
//! eviction plan and outcome records used across the remediate crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Allowed disruptions reported for pods no budget governs.
///
/// A large finite value keeps `min` and subtraction well defined.
pub const UNBOUNDED_DISRUPTIONS: i32 = i32::MAX;

// ============================================================================
// Object Identity
// ============================================================================

/// Identity of a cluster object. Cluster-scoped objects use an empty namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object such as a node
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Resource kinds the observer keeps in its view
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pod,
    Node,
    DisruptionBudget,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Pod, Self::Node, Self::DisruptionBudget];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pods",
            Self::Node => "nodes",
            Self::DisruptionBudget => "poddisruptionbudgets",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Pods
// ============================================================================

/// Readiness as reported by a `Ready` condition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Readiness {
    Ready,
    NotReady,
    #[default]
    Unknown,
}

impl Readiness {
    /// Map a condition status string ("True", "False", "Unknown")
    pub fn from_condition_status(status: Option<&str>) -> Self {
        match status {
            Some("True") => Self::Ready,
            Some("False") => Self::NotReady,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::NotReady => "NotReady",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    /// Completed pods hold no workload and are never evicted
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Controller that owns a pod
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Point-in-time view of a pod
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub node: Option<String>,
    pub owner: Option<WorkloadRef>,
    pub readiness: Readiness,
    pub phase: PodPhase,
    pub labels: BTreeMap<String, String>,
    pub restart_count: i32,
    pub created_at: Option<DateTime<Utc>>,

    /// Deletion timestamp is set on the server
    pub terminating: bool,

    /// Static pod mirrored by the kubelet
    pub mirror: bool,

    /// Evicted by us; the watch has not caught up yet
    pub pending_deletion: bool,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            node: None,
            owner: None,
            readiness: Readiness::Unknown,
            phase: PodPhase::Unknown,
            labels: BTreeMap::new(),
            restart_count: 0,
            created_at: None,
            terminating: false,
            mirror: false,
            pending_deletion: false,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Counts towards a budget's healthy pods
    pub fn is_healthy(&self) -> bool {
        self.readiness == Readiness::Ready
            && self.phase == PodPhase::Running
            && !self.terminating
            && !self.pending_deletion
    }

    /// Already on its way out, either server side or by our own eviction
    pub fn is_going_away(&self) -> bool {
        self.terminating || self.pending_deletion
    }

    pub fn is_daemon_set(&self) -> bool {
        self.owner.as_ref().is_some_and(|o| o.kind == "DaemonSet")
    }
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeCondition {
    Ready,
    NotReady,
    #[default]
    Unknown,
}

impl NodeCondition {
    pub fn from_condition_status(status: Option<&str>) -> Self {
        match status {
            Some("True") => Self::Ready,
            Some("False") => Self::NotReady,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::NotReady => "NotReady",
            Self::Unknown => "Unknown",
        }
    }
}

/// Point-in-time view of a node and the pods scheduled on it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRef {
    pub name: String,
    pub condition: NodeCondition,
    pub unschedulable: bool,

    /// Last transition of the Ready condition
    pub condition_since: Option<DateTime<Utc>>,

    /// Filled in when a snapshot is taken
    pub pods: BTreeSet<ObjectKey>,
}

impl NodeRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: NodeCondition::Unknown,
            unschedulable: false,
            condition_since: None,
            pods: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::cluster(&self.name)
    }
}

// ============================================================================
// Disruption Budgets
// ============================================================================

/// An absolute count or a percentage of the expected pod count
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntOrPercent {
    Int(i32),
    Percent(u32),
}

impl IntOrPercent {
    /// Parse "3" or "50%"
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            pct.trim().parse().ok().map(Self::Percent)
        } else {
            s.parse().ok().map(Self::Int)
        }
    }

    /// Resolve against `total`, rounding percentages up
    pub fn scaled(&self, total: i32) -> i32 {
        match *self {
            Self::Int(n) => n,
            Self::Percent(p) => {
                let total = i64::from(total.max(0));
                let scaled = (total * i64::from(p) + 99) / 100;
                i32::try_from(scaled).unwrap_or(i32::MAX)
            }
        }
    }
}

impl fmt::Display for IntOrPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Percent(p) => write!(f, "{}%", p),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetPolicy {
    MinAvailable(IntOrPercent),
    MaxUnavailable(IntOrPercent),
}

impl BudgetPolicy {
    /// Number of healthy pods that must remain for `expected` pods
    pub fn desired_healthy(&self, expected: i32) -> i32 {
        match self {
            Self::MinAvailable(v) => v.scaled(expected),
            Self::MaxUnavailable(v) => (expected - v.scaled(expected)).max(0),
        }
    }
}

impl fmt::Display for BudgetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinAvailable(v) => write!(f, "minAvailable={}", v),
            Self::MaxUnavailable(v) => write!(f, "maxUnavailable={}", v),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl SelectorOperator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "In" => Some(Self::In),
            "NotIn" => Some(Self::NotIn),
            "Exists" => Some(Self::Exists),
            "DoesNotExist" => Some(Self::DoesNotExist),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Label selector; an empty selector matches everything
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    pub fn with_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }
}

/// A PodDisruptionBudget as seen by the observer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisruptionBudget {
    pub namespace: String,
    pub name: String,

    /// `None` selects no pods
    pub selector: Option<LabelSelector>,
    pub policy: Option<BudgetPolicy>,

    /// Recomputed from the live pod set each time a snapshot is taken
    pub current_healthy: i32,
    pub expected_pods: i32,

    /// `status.expectedPods` as last reported by the API server
    ///
    /// Tracks the owning workload's scale, so it still counts a replica whose
    /// pod was deleted before its replacement was created.
    pub reported_expected: i32,
}

impl DisruptionBudget {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            selector: None,
            policy: None,
            current_healthy: 0,
            expected_pods: 0,
            reported_expected: 0,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Whether this budget's selector covers `pod`
    pub fn governs(&self, pod: &PodRef) -> bool {
        pod.namespace == self.namespace
            && self
                .selector
                .as_ref()
                .is_some_and(|s| s.matches(&pod.labels))
    }
}

/// Any object kept by the observer
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterObject {
    Pod(PodRef),
    Node(NodeRef),
    Budget(DisruptionBudget),
}

impl ClusterObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Pod(_) => ResourceKind::Pod,
            Self::Node(_) => ResourceKind::Node,
            Self::Budget(_) => ResourceKind::DisruptionBudget,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Pod(p) => p.key(),
            Self::Node(n) => n.key(),
            Self::Budget(b) => b.key(),
        }
    }
}

// ============================================================================
// Remediation, Plans and Outcomes
// ============================================================================

/// Why a pod was chosen for eviction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    NodeDrain { node: String },
    NodeNotReady { node: String },
    PodUnhealthy,
    Requested,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeDrain { node } => write!(f, "drain {}", node),
            Self::NodeNotReady { node } => write!(f, "node {} not ready", node),
            Self::PodUnhealthy => f.write_str("unhealthy"),
            Self::Requested => f.write_str("requested"),
        }
    }
}

/// A unit of remediation work handed to the planner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemediationRequest {
    /// Evict every drainable pod on a node
    DrainNode { node: String, reason: EvictionReason },

    /// Evict specific pods
    EvictPods {
        pods: Vec<ObjectKey>,
        reason: EvictionReason,
    },
}

impl RemediationRequest {
    pub fn drain(node: impl Into<String>) -> Self {
        let node = node.into();
        Self::DrainNode {
            reason: EvictionReason::NodeDrain { node: node.clone() },
            node,
        }
    }

    pub fn evict(pods: Vec<ObjectKey>) -> Self {
        Self::EvictPods {
            pods,
            reason: EvictionReason::Requested,
        }
    }
}

/// The budget group that serialises evictions
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DisruptionGroup {
    Budget(ObjectKey),
    Unbudgeted,
}

impl fmt::Display for DisruptionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Budget(key) => write!(f, "pdb:{}", key),
            Self::Unbudgeted => f.write_str("-"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvictionPlanEntry {
    pub pod: PodRef,
    pub reason: EvictionReason,

    /// Higher runs first
    pub priority: u8,
    pub group: DisruptionGroup,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionResult {
    Evicted,
    /// Budget allowed no disruption at check time; the entry was requeued
    DeniedBudget,
    /// The API refused the eviction permanently
    DeniedApi(String),
    /// Transient failure; another attempt is scheduled
    Retrying(String),
    Abandoned(String),
}

impl EvictionResult {
    /// No further attempts follow this result
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Evicted | Self::DeniedApi(_) | Self::Abandoned(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Evicted => "Evicted",
            Self::DeniedBudget => "Denied(budget)",
            Self::DeniedApi(_) => "Denied(apiError)",
            Self::Retrying(_) => "Retrying",
            Self::Abandoned(_) => "Abandoned",
        }
    }
}

impl fmt::Display for EvictionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeniedApi(msg) | Self::Retrying(msg) | Self::Abandoned(msg) => {
                write!(f, "{}: {}", self.label(), msg)
            }
            _ => f.write_str(self.label()),
        }
    }
}

/// Immutable record of one eviction attempt
#[derive(Clone, Debug, PartialEq)]
pub struct EvictionOutcome {
    pub pod: PodRef,
    pub result: EvictionResult,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl EvictionOutcome {
    pub fn new(pod: PodRef, result: EvictionResult, attempt: u32) -> Self {
        Self {
            pod,
            result,
            attempt,
            at: Utc::now(),
        }
    }
}
