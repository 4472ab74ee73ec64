//! Test doubles and assertions.
//!
//! - [`ScriptedContext`] runs no processes and answers by pattern
//! - [`StaticIdentityService`] issues or rejects credentials without a network
//! - Assertion helpers for reports and leftover credential files

mod assertions;
mod contexts;
mod identity;

pub use assertions::{
    assert_aborted_from, assert_no_credential_artifacts, assert_outcome, assert_stage_status,
    find_credential_artifacts,
};
pub use contexts::{RecordedExec, ScriptedContext};
pub use identity::StaticIdentityService;
