#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    pub workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    pub executed_tasks: usize,
    pub stolen_tasks: usize,
    pub replicated_joins: usize,
}

impl SchedulerMetrics {
    pub fn utilization(&self) -> f64 {
        if self.workers == 0 {
            return 0.0;
        }
        let busy = self.workers.saturating_sub(self.idle_workers);
        busy as f64 / self.workers as f64
    }

    pub fn queue_pressure(&self) -> f64 {
        self.queued_tasks as f64
    }

    /// Share of executions that came from another worker's queue.
    pub fn steal_ratio(&self) -> f64 {
        if self.executed_tasks == 0 {
            return 0.0;
        }
        self.stolen_tasks as f64 / self.executed_tasks as f64
    }
}
