//! Rule records

use crate::condition::{FuncRef, RuleCondition};
use crate::tracker::ScanDeps;
use std::path::PathBuf;

/// Rule identifier, unique per engine, issued from 1
pub type RuleId = u64;

/// A registered rule
#[derive(Debug)]
pub struct Rule {
    pub id: RuleId,
    /// Display name (`<file>/<name>` for named rules)
    pub name: String,
    pub condition: RuleCondition,
    /// The `then` callback
    pub then: FuncRef,
    /// Script file that defined the rule; rules defined outside any file
    /// (e.g. via string eval) have no owner
    pub owner: Option<PathBuf>,
    /// Dependencies committed after the last successful scan
    pub deps: ScanDeps,
    /// The last scan raised a script error (observable in the editor view)
    pub errored_last_scan: bool,
}

impl Rule {
    #[must_use]
    pub fn new(
        id: RuleId,
        name: &str,
        condition: RuleCondition,
        then: FuncRef,
        owner: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            condition,
            then,
            owner,
            deps: ScanDeps::default(),
            errored_last_scan: false,
        }
    }

    /// All captured functions held by the rule, for release on cleanup.
    #[must_use]
    pub fn func_refs(&self) -> Vec<FuncRef> {
        let mut refs = self.condition.func_refs();
        refs.push(self.then);
        refs
    }
}
