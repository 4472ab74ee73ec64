//! Environment provisioning.
//!
//! [`EnvironmentProvisioner::ensure`] makes a capability available in an
//! execution context. The [`ProvisioningLedger`] remembers what each context
//! already has, so repeated calls are side-effect free.

mod provisioner;
mod recipe;
mod record;

pub use provisioner::EnvironmentProvisioner;
pub use recipe::{InstallRecipe, DEFAULT_INSTALL_TIMEOUT, MSSQL_DRIVER_NAME};
pub use record::{CapabilityEntry, ProvisionSource, ProvisioningLedger, ProvisioningRecord};
