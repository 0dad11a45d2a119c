//! Rule table, dependency indices and candidate selection
//!
//! The table preserves definition order; within one scan, rules are
//! evaluated in the order they were defined. Candidate selection is
//! polling-free: rules are indexed by the cells and named timers their
//! conditions touched on the previous scan, plus a fallback set for
//! conditions that have no dependencies yet.

use crate::condition::RuleCondition;
use crate::error::RuleError;
use crate::rule::{Rule, RuleId};
use crate::tracker::ScanDeps;
use cell_model::CellSpec;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// What caused a scan
#[derive(Debug, Clone)]
pub enum ScanTrigger {
    /// Engine initialization after retained values settle
    Init,
    /// MQTT value/type change on a cell
    CellChange(CellSpec),
    /// A named timer fired
    Timer(String),
    /// Explicit `runRules()`
    RunRules,
    /// Cron tick for exactly one rule
    Cron(RuleId),
}

/// The rule table
#[derive(Default)]
pub struct RuleEngine {
    rules: HashMap<RuleId, Rule>,
    order: Vec<RuleId>,
    names: HashSet<String>,
    cell_index: HashMap<CellSpec, HashSet<RuleId>>,
    timer_index: HashMap<String, HashSet<RuleId>>,
    /// Rules with no dependencies yet: scanned on every candidate
    /// selection until they touch something
    uncommitted: HashSet<RuleId>,
    next_id: RuleId,
}

impl RuleEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Register a rule; returns its id.
    pub fn define(
        &mut self,
        name: &str,
        condition: RuleCondition,
        then: crate::condition::FuncRef,
        owner: Option<PathBuf>,
    ) -> Result<RuleId, RuleError> {
        if !name.is_empty() && !self.names.insert(name.to_string()) {
            return Err(RuleError::DuplicateName(name.to_string()));
        }

        let id = self.next_id;
        self.next_id += 1;

        // cells referenced directly (whenChanged "dev/cell") are indexed
        // up front; tracked dependencies replace nothing here
        for cell in condition.static_cells() {
            self.cell_index.entry(cell).or_default().insert(id);
        }
        let statically_indexed = !condition.static_cells().is_empty();
        if !condition.is_cron() && !statically_indexed {
            self.uncommitted.insert(id);
        }

        let rule = Rule::new(id, name, condition, then, owner);
        tracing::debug!("defined rule {} '{}'", id, rule.name);
        self.rules.insert(id, rule);
        self.order.push(id);
        Ok(id)
    }

    #[must_use]
    pub fn rule(&self, id: RuleId) -> Option<&Rule> {
        self.rules.get(&id)
    }

    pub fn rule_mut(&mut self, id: RuleId) -> Option<&mut Rule> {
        self.rules.get_mut(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Rule ids to scan for a trigger, in definition order.
    #[must_use]
    pub fn candidates(&self, trigger: &ScanTrigger) -> Vec<RuleId> {
        let member: Box<dyn Fn(&Rule) -> bool + '_> = match trigger {
            ScanTrigger::Init | ScanTrigger::RunRules => {
                Box::new(|rule: &Rule| !rule.condition.is_cron())
            }
            ScanTrigger::CellChange(spec) => {
                let indexed = self.cell_index.get(spec);
                Box::new(move |rule: &Rule| {
                    !rule.condition.is_cron()
                        && (indexed.is_some_and(|set| set.contains(&rule.id))
                            || self.uncommitted.contains(&rule.id))
                })
            }
            ScanTrigger::Timer(name) => {
                let indexed = self.timer_index.get(name);
                Box::new(move |rule: &Rule| {
                    !rule.condition.is_cron()
                        && (indexed.is_some_and(|set| set.contains(&rule.id))
                            || self.uncommitted.contains(&rule.id))
                })
            }
            ScanTrigger::Cron(id) => {
                let id = *id;
                Box::new(move |rule: &Rule| rule.id == id)
            }
        };

        self.order
            .iter()
            .copied()
            .filter(|id| self.rules.get(id).is_some_and(|rule| member(rule)))
            .collect()
    }

    /// Replace a rule's tracked dependencies.
    ///
    /// Called at the end of a successful scan only; a condition that threw
    /// keeps its previous dependency set (partial replacement is
    /// forbidden).
    pub fn commit_deps(&mut self, id: RuleId, deps: ScanDeps) {
        let Some(rule) = self.rules.get_mut(&id) else {
            return;
        };
        let old = std::mem::replace(&mut rule.deps, deps.clone());
        let statically_indexed = !rule.condition.static_cells().is_empty();

        for cell in &old.cells {
            if let Some(set) = self.cell_index.get_mut(cell) {
                set.remove(&id);
            }
        }
        for timer in &old.timers {
            if let Some(set) = self.timer_index.get_mut(timer) {
                set.remove(&id);
            }
        }
        // re-add static cells dropped by the sweep above
        if statically_indexed {
            if let Some(rule) = self.rules.get(&id) {
                for cell in rule.condition.static_cells() {
                    self.cell_index.entry(cell).or_default().insert(id);
                }
            }
        }
        for cell in &deps.cells {
            self.cell_index.entry(cell.clone()).or_default().insert(id);
        }
        for timer in &deps.timers {
            self.timer_index
                .entry(timer.clone())
                .or_default()
                .insert(id);
        }

        let is_cron = self
            .rules
            .get(&id)
            .is_some_and(|rule| rule.condition.is_cron());
        if deps.is_empty() && !statically_indexed && !is_cron {
            self.uncommitted.insert(id);
        } else {
            self.uncommitted.remove(&id);
        }
    }

    /// Remove every rule owned by the given script; returns the removed
    /// rules so the host can release their captured functions.
    pub fn remove_owned(&mut self, owner: &Path) -> Vec<Rule> {
        let doomed: Vec<RuleId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.rules
                    .get(id)
                    .is_some_and(|r| r.owner.as_deref() == Some(owner))
            })
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    /// Remove a single rule.
    pub fn remove(&mut self, id: RuleId) -> Option<Rule> {
        let rule = self.rules.remove(&id)?;
        self.order.retain(|r| *r != id);
        self.names.remove(&rule.name);
        self.uncommitted.remove(&id);
        for set in self.cell_index.values_mut() {
            set.remove(&id);
        }
        for set in self.timer_index.values_mut() {
            set.remove(&id);
        }
        tracing::debug!("removed rule {} '{}'", id, rule.name);
        Some(rule)
    }

    /// Cron rules currently registered, for the driver to (re)schedule.
    #[must_use]
    pub fn cron_rules(&self) -> Vec<(RuleId, String)> {
        self.order
            .iter()
            .filter_map(|id| {
                let rule = self.rules.get(id)?;
                let expr = rule.condition.cron_expr()?;
                Some((*id, expr.to_string()))
            })
            .collect()
    }
}
