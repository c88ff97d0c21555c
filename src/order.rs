//! Load ordering for themes that override each other.
//!
//! A theme's score is minus the number of dependency paths that end at it, so
//! every dependency scores strictly lower than each theme depending on it.
//! Loading in ascending score order brings dependencies up first.

use crate::error::{Error, Result};
use std::collections::HashMap;

pub struct DependencyGraph {
    names: Vec<String>,
    /// theme -> themes that depend on it. Unknown dependency names are dropped.
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new<'a, D>(themes: impl IntoIterator<Item = (&'a str, D)>) -> Self
    where
        D: IntoIterator<Item = &'a str>,
    {
        let themes: Vec<(&str, Vec<&str>)> = themes
            .into_iter()
            .map(|(name, deps)| (name, deps.into_iter().collect()))
            .collect();
        let names: Vec<String> = themes.iter().map(|(name, _)| name.to_string()).collect();

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (name, deps) in &themes {
            for dep in deps {
                if names.iter().any(|n| n == dep) {
                    dependents.entry(dep.to_string()).or_default().push(name.to_string());
                }
            }
        }
        Self { names, dependents }
    }

    pub fn scores(&self) -> Result<HashMap<String, i64>> {
        let mut memo = HashMap::new();
        let mut path = Vec::new();
        for name in &self.names {
            self.paths_into(name, &mut memo, &mut path)?;
        }
        Ok(memo.into_iter().map(|(name, paths)| (name, -paths)).collect())
    }

    fn paths_into(
        &self,
        name: &str,
        memo: &mut HashMap<String, i64>,
        path: &mut Vec<String>,
    ) -> Result<i64> {
        if let Some(paths) = memo.get(name) {
            return Ok(*paths);
        }
        if let Some(start) = path.iter().position(|n| n == name) {
            let mut cycle: Vec<String> = path[start..].iter().rev().cloned().collect();
            cycle.insert(0, name.to_string());
            return Err(Error::Cycle(cycle));
        }

        path.push(name.to_string());
        let mut total = 0;
        for dependent in self.dependents.get(name).into_iter().flatten() {
            total += 1 + self.paths_into(dependent, memo, path)?;
        }
        path.pop();

        memo.insert(name.to_string(), total);
        Ok(total)
    }

    /// Theme names, dependencies first. Ties keep their input order.
    pub fn load_order(&self) -> Result<Vec<String>> {
        let scores = self.scores()?;
        let mut order = self.names.clone();
        order.sort_by_key(|name| scores.get(name).copied().unwrap_or_default());
        Ok(order)
    }
}
