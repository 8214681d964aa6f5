//! Remediation engine
//!
//! Keeps a watched view of pods, nodes and disruption budgets, plans evictions
//! that respect those budgets and executes them behind a rate limiter and
//! circuit breaker.

pub mod backoff;
pub mod breaker;
pub mod budget;
pub mod config;
pub mod controller;
mod error;
pub mod executor;
pub mod observer;
pub mod planner;
mod snapshot;

#[cfg(test)]
mod fake;

pub use breaker::{CircuitBreaker, CircuitState, RateLimiter, Throttle};
pub use budget::{BudgetStatus, allowed_disruptions};
pub use config::{
    BreakerConfig, ControllerConfig, EngineConfig, ExecutorConfig, ObserverConfig, RateConfig,
};
pub use controller::{RemediationController, detect_remediations};
pub use error::{ObserverError, PlanError};
pub use executor::{EvictionExecutor, ExecutionReport, ReportSummary};
pub use observer::{ClusterObserver, ClusterStore, StateChange};
pub use planner::{EvictionPlan, SkipReason, plan};
pub use snapshot::ClusterSnapshot;
