//! Core domain types for ciflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage status, run outcome and the run state machine
//! - Capabilities stages can require
//! - Pipeline lifecycle events

mod capability;
mod event;
mod status;

pub use capability::Capability;
pub use event::PipelineEvent;
pub use status::{InvalidTransition, Outcome, RunState, StageStatus};
