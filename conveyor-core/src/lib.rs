//! Conveyor Core
//!
//! Core types and abstractions for the Conveyor deployment pipeline.
//!
//! This crate contains:
//! - Domain types: Core business entities (BuildArtifact, PipelineRun, ApprovalRequest, etc.)
//! - DTOs: Data transfer objects for the orchestrator API

pub mod domain;
pub mod dto;
