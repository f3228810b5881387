use std::sync::Arc;

use itm_common::{Change, ChangeHandler, TaskResult};
use tracing::debug;

use crate::lifecycle::{LifecycleEvent, LifecycleManager};
use crate::types::MonitorEvent;

/// Handles liveness verdicts from the monitoring collaborator.
#[derive(Debug)]
pub struct MonitorListener {
    lifecycle: Arc<LifecycleManager>,
}

impl MonitorListener {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }
}

impl ChangeHandler<MonitorEvent> for MonitorListener {
    fn name(&self) -> &str {
        "monitor"
    }

    fn on_change(&self, change: Change<MonitorEvent>) -> TaskResult<()> {
        change.kind()?;
        let Some(event) = change.new else {
            // Session withdrawn; the port stream reports the teardown.
            return Ok(());
        };
        debug!(tunnel = %event.tunnel, alive = event.alive, "liveness reported");
        self.lifecycle
            .schedule_event(event.tunnel, LifecycleEvent::Liveness { alive: event.alive })?;
        Ok(())
    }
}
