//! Scheduler layer for the orchestrator
//!
//! Watches the configuration repository so that CD runs start even when
//! no push webhook reaches the orchestrator.

pub mod poller;

pub use poller::ConfigRepoPoller;
