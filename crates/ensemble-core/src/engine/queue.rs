use crate::core::models::unit::WorkUnit;

/// Pending units, popped last-in first-out. A popped unit is gone from the queue for good.
#[derive(Debug, Default)]
pub struct WorkQueue {
    stack: Vec<WorkUnit>,
}

impl WorkQueue {
    pub fn new(units: Vec<WorkUnit>) -> Self {
        Self { stack: units }
    }

    /// Builds a queue from units listed most important first, so the first one pops first.
    pub fn from_prioritized(units: Vec<WorkUnit>) -> Self {
        let mut stack = units;
        stack.reverse();
        Self { stack }
    }

    pub fn pop(&mut self) -> Option<WorkUnit> {
        self.stack.pop()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Names of the pending units in pop order.
    pub fn pending_names(&self) -> Vec<String> {
        self.stack.iter().rev().map(WorkUnit::name).collect()
    }

    /// Empties the queue and returns what was still pending.
    pub fn clear(&mut self) -> Vec<WorkUnit> {
        std::mem::take(&mut self.stack)
    }
}
