//! Isolated execution contexts for stages.
//!
//! A context is either a plain host process ([`LocalContext`]) or a
//! long-lived container ([`ContainerContext`]). Both clear the inherited
//! environment and run steps with an explicit [`StepEnvironment`].

mod container;
mod env;
mod local;
mod process;

pub use container::{ContainerContext, CONTAINER_ROOT};
pub use env::{StepEnvironment, HOST_ALLOW_LIST};
pub use local::LocalContext;
pub use process::{ExecOutcome, ExecRequest, ExecStatus};

use crate::errors::CiflowError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// An isolated place where steps run.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Unique id of this context instance; keys the provisioning ledger.
    fn id(&self) -> Uuid;

    /// Name stages refer to.
    fn name(&self) -> &str;

    /// Short kind label for logs.
    fn kind(&self) -> &'static str;

    /// Translates a host path under the checkout to the path steps see.
    fn map_path(&self, host_path: &Path) -> PathBuf;

    /// Runs one command.
    async fn exec(&self, request: ExecRequest<'_>) -> Result<ExecOutcome, CiflowError>;

    /// Releases whatever the context started. Safe to call more than once.
    async fn shutdown(&self) -> Result<(), CiflowError>;
}

/// How a context is realized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ContextKind {
    /// Host process.
    Local,
    /// Container running `image`.
    Container {
        /// Image reference.
        image: String,
    },
}

/// Declaration of a named execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSpec {
    /// Name stages refer to.
    pub name: String,
    /// How to realize it.
    #[serde(flatten)]
    pub kind: ContextKind,
}

impl ContextSpec {
    /// A host-process context.
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ContextKind::Local,
        }
    }

    /// A container context.
    #[must_use]
    pub fn container(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ContextKind::Container { image: image.into() },
        }
    }

    /// Instantiates the context for one run.
    #[must_use]
    pub fn build(&self, checkout: &Path, run_label: &str) -> Arc<dyn ExecutionContext> {
        match &self.kind {
            ContextKind::Local => Arc::new(LocalContext::new(&self.name, checkout)),
            ContextKind::Container { image } => {
                Arc::new(ContainerContext::new(&self.name, image, checkout, run_label))
            }
        }
    }
}

/// The contexts owned by one run, looked up by name.
#[derive(Clone, Default)]
pub struct ContextPool {
    contexts: Vec<Arc<dyn ExecutionContext>>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.contexts.iter().map(|c| c.name().to_string())).finish()
    }
}

impl ContextPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one context per spec.
    #[must_use]
    pub fn from_specs(specs: &[ContextSpec], checkout: &Path, run_label: &str) -> Self {
        let mut pool = Self::new();
        for spec in specs {
            pool.insert(spec.build(checkout, run_label));
        }
        pool
    }

    /// Adds a context, replacing any with the same name.
    pub fn insert(&mut self, context: Arc<dyn ExecutionContext>) {
        let name = context.name().to_string();
        if let Some(&idx) = self.by_name.get(&name) {
            self.contexts[idx] = context;
        } else {
            self.by_name.insert(name, self.contexts.len());
            self.contexts.push(context);
        }
    }

    /// Looks a context up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutionContext>> {
        self.by_name.get(name).map(|&idx| self.contexts[idx].clone())
    }

    /// All contexts in insertion order.
    #[must_use]
    pub fn all(&self) -> &[Arc<dyn ExecutionContext>] {
        &self.contexts
    }

    /// Number of contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns true if the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
