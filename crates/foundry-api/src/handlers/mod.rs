//! HTTP handlers for the build agent and the router.

pub mod build;
pub mod download;
pub mod health;
pub mod route;

use foundry_services::{AgentRouter, JobAdmissionController};

#[derive(Clone)]
pub struct BuilderState {
    pub controller: JobAdmissionController,
}

#[derive(Clone)]
pub struct RouterState {
    pub router: AgentRouter,
    /// Port advertised for records that do not carry one.
    pub default_worker_port: u16,
}
