//! Execution-slot allocation strategies.
//!
//! The execute heartbeat has a budget of concurrent slots and must decide which
//! task classes get them. Two interchangeable strategies: oldest-first across
//! all classes, or a fair division of slots proportional to configured class
//! priorities (see `divide`).

pub mod divide;

use serde::{Deserialize, Serialize};

pub use divide::{Allocation, ClassBacklog, divide_slots};

/// Which allocation strategy the execute heartbeat uses. Oldest-first is the
/// default and the fallback when the fair-share strategy fails for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityStrategyKind {
    #[default]
    SortByDateCreated,
    DivideTotalValueEqually,
}

impl PriorityStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityStrategyKind::SortByDateCreated => "sort-by-date-created",
            PriorityStrategyKind::DivideTotalValueEqually => "divide-total-value-equally",
        }
    }
}
