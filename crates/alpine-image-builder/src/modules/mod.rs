use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod bootstrap;
pub mod core;
pub mod customize;
pub mod guest;
pub mod mounts;
pub mod network;
pub mod package;
pub mod target;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub(crate) fn default_true() -> bool {
    true
}

/// The module-level table (`[bootstrap]`, `[customize]`, ...). Only the
/// switch is read here; stage settings live under `<module>.steps.<step>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModuleToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ModuleToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Pipeline order; the planner derives the real order from task edges.
pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(target::TargetModule),
        Box::new(bootstrap::BootstrapModule),
        Box::new(network::NetworkModule),
        Box::new(mounts::MountsModule),
        Box::new(customize::CustomizeModule),
        Box::new(guest::GuestModule),
        Box::new(package::PackageModule),
    ]
}

/// Plan every detected module and close the customize sequence.
pub fn build_plan(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(doc) {
            tracing::debug!(module = m.id(), "planning module");
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}
