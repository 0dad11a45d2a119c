//! The rule condition taxonomy
//!
//! Conditions form a sealed tagged union; the engine dispatches on the
//! tag, no trait objects involved. Script functions captured by the host
//! are referenced through opaque [`FuncRef`] handles.

use cell_model::{CellSpec, Value};

/// Opaque handle to a captured script function
pub type FuncRef = u64;

/// Condition of a rule
#[derive(Debug, Clone)]
pub enum RuleCondition {
    /// `when:` re-evaluates on every scan and fires while truthy
    Level { func: FuncRef },
    /// `asSoonAs:` fires on the false-to-true transition
    Edge { func: FuncRef, last: bool },
    /// `whenChanged: "dev/cell"` fires when the cell's value differs
    /// from the last observed one (every publish for pushbuttons)
    CellChanged {
        cell: CellSpec,
        last: Option<Value>,
    },
    /// `whenChanged: function` fires when the expression's result
    /// changes (strict equality for primitives, identity for objects)
    FuncValueChanged {
        func: FuncRef,
        last: Option<Value>,
    },
    /// Multi-element `whenChanged`, a disjunction of the above
    Or { children: Vec<RuleCondition> },
    /// `when: cron("...")` fires only when the cron driver posts it
    Cron { expr: String },
}

impl RuleCondition {
    /// Cells referenced directly by the condition, known at definition
    /// time (as opposed to dependencies discovered by tracking).
    #[must_use]
    pub fn static_cells(&self) -> Vec<CellSpec> {
        match self {
            RuleCondition::CellChanged { cell, .. } => vec![cell.clone()],
            RuleCondition::Or { children } => children
                .iter()
                .flat_map(RuleCondition::static_cells)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Captured functions held by the condition, for release on cleanup.
    #[must_use]
    pub fn func_refs(&self) -> Vec<FuncRef> {
        match self {
            RuleCondition::Level { func } | RuleCondition::Edge { func, .. } => vec![*func],
            RuleCondition::FuncValueChanged { func, .. } => vec![*func],
            RuleCondition::Or { children } => {
                children.iter().flat_map(RuleCondition::func_refs).collect()
            }
            RuleCondition::CellChanged { .. } | RuleCondition::Cron { .. } => Vec::new(),
        }
    }

    /// Whether any part of the condition needs a callback invocation.
    #[must_use]
    pub fn has_funcs(&self) -> bool {
        !self.func_refs().is_empty()
    }

    #[must_use]
    pub fn is_cron(&self) -> bool {
        matches!(self, RuleCondition::Cron { .. })
    }

    /// The cron expression, if this is a cron condition.
    #[must_use]
    pub fn cron_expr(&self) -> Option<&str> {
        match self {
            RuleCondition::Cron { expr } => Some(expr),
            _ => None,
        }
    }
}
