use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::modules::{Module, ModuleToggle};
use crate::planner::{Plan, Task};

/// Modules every image needs; `enabled = false` on them is a config error.
const REQUIRED_MODULES: &[&str] = &[
    "target",
    "bootstrap",
    "network",
    "mounts",
    "customize",
    "package",
];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        for id in REQUIRED_MODULES {
            let toggle: ModuleToggle = doc.deserialize_path(id)?.unwrap_or_default();
            if !toggle.enabled {
                return Err(Error::config(format!(
                    "[{id}].enabled=false is not allowed (every image needs the {id} stages)"
                )));
            }
        }
        crate::modules::guest::check_config(doc)?;

        plan.add(Task {
            id: "core.init".into(),
            label: "Validate build settings".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
            requires: vec![],
        })
    }
}
