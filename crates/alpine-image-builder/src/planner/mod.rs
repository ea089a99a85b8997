use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

/// Barrier closing the customize sequence; see [`Plan::finalize_default`].
pub const CUSTOMIZE_BARRIER: &str = "core.barrier.customize";

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens that must run first. A trailing `?` marks
    /// the edge optional (ignored when nothing provides it).
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
    /// Preconditions checked by the executor right before the task runs.
    pub requires: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    fn providers(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{p}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Resolve an `after` entry to a task id; `None` for a missing optional edge.
    fn resolve<'a>(
        &'a self,
        providers: &BTreeMap<&'a str, &'a str>,
        owner: &str,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = match dep.strip_suffix('?') {
            Some(d) => (d, true),
            None => (dep, false),
        };
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = providers.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::msg(format!(
            "task '{owner}' has unknown dependency '{dep}'"
        )))
    }

    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let providers = self.providers()?;
        let mut out = Vec::new();
        for task in self.tasks.values() {
            for dep in &task.after {
                if let Some(from) = self.resolve(&providers, &task.id, dep)? {
                    out.push((from, task.id.as_str()));
                }
            }
        }
        Ok(out)
    }

    /// Topological order; ties break by task id so the result is stable.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (from, to) in self.edges()? {
            if outgoing.entry(from).or_default().insert(to)
                && let Some(n) = incoming.get_mut(to)
            {
                *n += 1;
            }
        }

        let mut ready: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, n)| (*n == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(id) = ready.pop_front() {
            if let Some(task) = self.tasks.get(id) {
                out.push(task);
            }
            for &next in outgoing.get(id).into_iter().flatten() {
                if let Some(n) = incoming.get_mut(next) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let stuck: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, n)| (*n > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                stuck.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn finalize_default(&mut self) -> Result<()> {
        self.add_customize_barrier()
    }

    // Every task providing a "customize:" token feeds one barrier that
    // provides "customize:done"; later stages depend on that token only.
    fn add_customize_barrier(&mut self) -> Result<()> {
        if self.tasks.contains_key(CUSTOMIZE_BARRIER) {
            return Ok(());
        }
        let after: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.provides.iter().any(|p| p.starts_with("customize:")))
            .map(|t| t.id.clone())
            .collect();

        self.add(Task {
            id: CUSTOMIZE_BARRIER.into(),
            label: "Customization complete".into(),
            module: "core".into(),
            phase: "barrier".into(),
            after,
            provides: vec!["customize:done".into()],
            requires: vec![],
        })
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, to) in self.edges()? {
            out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
            requires: vec![],
        }
    }

    #[test]
    fn orders_by_tokens_and_ids() {
        let mut plan = Plan::default();
        plan.add(task("b.second", &["x:first"], &[])).unwrap();
        plan.add(task("a.first", &[], &["x:first"])).unwrap();
        plan.add(task("c.third", &["b.second", "missing:token?"], &[]))
            .unwrap();
        let ids: Vec<_> = plan.ordered().unwrap().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, ["a.first", "b.second", "c.third"]);
    }

    #[test]
    fn unknown_required_dependency_fails() {
        let mut plan = Plan::default();
        plan.add(task("a", &["nope"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("unknown dependency 'nope'"), "{err}");
    }

    #[test]
    fn cycles_are_reported() {
        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).unwrap();
        plan.add(task("b", &["a"], &[])).unwrap();
        assert!(plan.ordered().unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn barrier_waits_for_every_customize_provider() {
        let mut plan = Plan::default();
        plan.add(task("customize.one", &[], &["customize:one"])).unwrap();
        plan.add(task("customize.two", &["customize:one"], &["customize:two"]))
            .unwrap();
        plan.add(task("package.archive", &["customize:done"], &[]))
            .unwrap();
        plan.finalize_default().unwrap();

        let barrier = plan.get(CUSTOMIZE_BARRIER).unwrap();
        assert_eq!(barrier.after, ["customize.one", "customize.two"]);
        let ids: Vec<_> = plan.ordered().unwrap().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids.last().map(String::as_str), Some("package.archive"));
    }
}
