//! Agent task types, one per pipeline phase that drives an agent process.
//!
//! Every agent is a concrete type implementing [`AgentTask`] with a typed
//! context; shared plumbing (workspace state, prompt templates, execution)
//! is composed via [`harness::AgentHarness`] rather than inherited.

pub mod architect;
pub mod comparator;
pub mod harness;
pub mod implementer;
pub mod integrator;
pub mod reviewer;
pub mod tester;

use anyhow::Result;
use async_trait::async_trait;

pub use architect::{Approach, ArchitectAgent, ArchitectContext};
pub use comparator::{ComparatorAgent, ComparisonContext, ComparisonEntry};
pub use implementer::{ImplementationContext, ImplementerAgent};
pub use integrator::{IntegrationContext, IntegratorAgent, MergeRecord};
pub use reviewer::{ReviewContext, ReviewerAgent};
pub use tester::{TestContext, TesterAgent};

/// One unit of agent-driven work: a typed context in, a typed result out.
#[async_trait]
pub trait AgentTask {
    type Context: Send;
    type Output: Send;

    async fn run(&self, context: Self::Context) -> Result<Self::Output>;
}
