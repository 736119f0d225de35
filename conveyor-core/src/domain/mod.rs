//! Core domain types
//!
//! This module contains the core domain structures used across Conveyor services.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (which owns and persists them) and its clients.

pub mod approval;
pub mod artifact;
pub mod descriptor;
pub mod rollout;
pub mod run;
pub mod trigger;

mod yaml_source;
