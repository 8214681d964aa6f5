//! Plain-text rendering of pods, plans and execution reports

use std::fmt::Write;

use tabled::settings::Style;
use tabled::{Table, Tabled};

use remediate_engine::{ClusterSnapshot, EvictionPlan, ExecutionReport, allowed_disruptions};
use remediate_types::{EvictionOutcome, EvictionResult, PodRef, UNBOUNDED_DISRUPTIONS};

/// Row for the pods table
#[derive(Tabled)]
struct PodRow {
    #[tabled(rename = "NAMESPACE")]
    namespace: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "NODE")]
    node: String,
    #[tabled(rename = "READY")]
    state: String,
    #[tabled(rename = "RESTARTS")]
    restarts: i32,
    #[tabled(rename = "BUDGET")]
    budget: String,
}

/// Row for the dry-run plan table
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "POD")]
    pod: String,
    #[tabled(rename = "PRIORITY")]
    priority: u8,
    #[tabled(rename = "GROUP")]
    group: String,
    #[tabled(rename = "ALLOWED")]
    allowed: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

/// Pod table, optionally restricted to a node and/or namespace
pub fn pods_table(
    snapshot: &ClusterSnapshot,
    node: Option<&str>,
    namespace: Option<&str>,
) -> String {
    let rows: Vec<PodRow> = snapshot
        .pods
        .values()
        .filter(|p| node.is_none_or(|n| p.node.as_deref() == Some(n)))
        .filter(|p| namespace.is_none_or(|ns| p.namespace == ns))
        .map(|pod| pod_row(snapshot, pod))
        .collect();

    if rows.is_empty() {
        return "No pods found\n".to_string();
    }
    render(rows)
}

fn pod_row(snapshot: &ClusterSnapshot, pod: &PodRef) -> PodRow {
    let state = if pod.is_going_away() {
        "Terminating"
    } else {
        pod.readiness.as_str()
    };
    PodRow {
        namespace: pod.namespace.clone(),
        name: pod.name.clone(),
        node: pod.node.clone().unwrap_or_else(|| "<none>".to_string()),
        state: state.to_string(),
        restarts: pod.restart_count,
        budget: snapshot.group_of(pod).to_string(),
    }
}

/// Dry-run view of a plan
///
/// ALLOWED is the headroom the executor will see for that pod: the minimum over
/// every budget governing it.
pub fn plan_table(plan: &EvictionPlan, snapshot: &ClusterSnapshot) -> String {
    let mut out = String::new();

    if plan.is_empty() {
        out.push_str("Nothing to evict\n");
    } else {
        let rows = plan.entries.iter().enumerate().map(|(i, entry)| PlanRow {
            position: i + 1,
            pod: entry.pod.key().to_string(),
            priority: entry.priority,
            group: entry.group.to_string(),
            allowed: format_allowed(allowed_disruptions(snapshot, &entry.pod)),
            reason: entry.reason.to_string(),
        });
        out.push_str(&render(rows));
    }

    for (key, reason) in &plan.skipped {
        let _ = writeln!(out, "skipped {} ({})", key, reason.as_str());
    }
    out
}

/// One progress line per recorded outcome
pub fn outcome_line(outcome: &EvictionOutcome) -> String {
    format!(
        "{:<48} {} (attempt {})",
        outcome.pod.key().to_string(),
        outcome.result,
        outcome.attempt
    )
}

/// Counts per result followed by every pod that was not evicted
pub fn summary(report: &ExecutionReport) -> String {
    let s = report.summary();
    let mut out = format!(
        "evicted: {}, denied: {}, abandoned: {} (budget waits: {}, retries: {})\n",
        s.evicted, s.denied_api, s.abandoned, s.budget_denials, s.retries
    );

    for outcome in report.final_outcomes() {
        if outcome.result != EvictionResult::Evicted {
            let _ = writeln!(out, "  {}: {}", outcome.pod.key(), outcome.result);
        }
    }
    out
}

fn format_allowed(allowed: i32) -> String {
    if allowed == UNBOUNDED_DISRUPTIONS {
        "unlimited".to_string()
    } else {
        allowed.to_string()
    }
}

fn render<T: Tabled>(rows: impl IntoIterator<Item = T>) -> String {
    let mut table = Table::new(rows).with(Style::blank()).to_string();
    table.push('\n');
    table
}
