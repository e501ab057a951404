//! Worker selection — rank live workers by load and pick the best one.

use std::cmp::Ordering;

use foundry_core::ServiceRecord;

use crate::catalog::ServiceCatalog;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("No running build agents")]
    NoWorkersAvailable,
    #[error("all build agents are overloaded")]
    Overloaded,
}

/// Ascending by `jobCount / cpuCount`. Records whose weight is undefined
/// (`NaN`, from `cpuCount == 0` on an idle node) compare greater than any
/// number, so together with `inf` they end up last.
fn by_weight(a: &ServiceRecord, b: &ServiceRecord) -> Ordering {
    let (wa, wb) = (a.weight(), b.weight());
    wa.partial_cmp(&wb)
        .unwrap_or_else(|| wa.is_nan().cmp(&wb.is_nan()))
}

/// Stable sort by weight: equal weights keep catalog order.
pub fn sort_by_weight(records: &mut [ServiceRecord]) {
    records.sort_by(by_weight);
}

/// Least loaded record, first in catalog order on ties.
pub fn select(records: &[ServiceRecord]) -> Result<&ServiceRecord, RouteError> {
    records
        .iter()
        .min_by(|a, b| by_weight(a, b))
        .ok_or(RouteError::NoWorkersAvailable)
}

/// Picks a build agent for each client request.
#[derive(Clone)]
pub struct AgentRouter {
    catalog: ServiceCatalog,
    /// 0 disables the guard.
    overload_threshold: u32,
}

impl AgentRouter {
    pub fn new(catalog: ServiceCatalog, overload_threshold: u32) -> Self {
        Self {
            catalog,
            overload_threshold,
        }
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    /// The record of the agent the client should talk to.
    pub async fn route(&self) -> Result<ServiceRecord, RouteError> {
        let services = match self.catalog.get_services().await {
            Ok(services) => services,
            Err(e) => {
                tracing::error!(error = %e, "cannot list build agents");
                return Err(RouteError::NoWorkersAvailable);
            }
        };
        let best = select(&services)?;
        if self.overload_threshold > 0 && best.job_count > self.overload_threshold {
            tracing::warn!(
                endpoint = %best.endpoint(),
                job_count = best.job_count,
                "best build agent is overloaded"
            );
            return Err(RouteError::Overloaded);
        }
        tracing::debug!(endpoint = %best.endpoint(), weight = best.weight(), "routed");
        Ok(best.clone())
    }
}
