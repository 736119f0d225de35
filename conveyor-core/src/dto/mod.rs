//! Data Transfer Objects for the orchestrator API
//!
//! This module contains DTOs used for communication between the orchestrator
//! and its callers (CLI, approval notifiers, dashboards). DTOs are lightweight
//! representations of domain entities optimized for network transfer.

pub mod approval;
pub mod run;
