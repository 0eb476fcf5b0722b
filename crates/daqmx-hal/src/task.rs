//! Scoped task ownership.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::driver::{DaqmxDriver, TaskHandle};
use crate::error::Result;

/// An exclusively owned driver task.
///
/// The task is cleared when the `ScopedTask` is dropped, so a task created on
/// a path that later fails never outlives its owner. Use [`ScopedTask::clear`]
/// where the clear error should be reported instead of logged.
pub struct ScopedTask {
    driver: Arc<dyn DaqmxDriver>,
    handle: TaskHandle,
    name: String,
    live: bool,
}

impl ScopedTask {
    /// Create a new task on the driver.
    pub fn create(driver: Arc<dyn DaqmxDriver>, name: &str) -> Result<Self> {
        let handle = driver.create_task(name)?;
        debug!(task = name, %handle, "Created task");
        Ok(Self {
            driver,
            handle,
            name: name.to_string(),
            live: true,
        })
    }

    /// The underlying handle.
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    /// The task name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The driver this task lives on.
    pub fn driver(&self) -> &Arc<dyn DaqmxDriver> {
        &self.driver
    }

    /// Clear the task, reporting any driver error.
    pub fn clear(mut self) -> Result<()> {
        self.live = false;
        debug!(task = %self.name, handle = %self.handle, "Clearing task");
        self.driver.clear_task(self.handle)
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.driver.clear_task(self.handle) {
                warn!(task = %self.name, error = %e, "Failed to clear task on drop");
            }
        }
    }
}

impl std::fmt::Debug for ScopedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedTask")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Op, SimulatedDaqmx};

    #[test]
    fn test_drop_clears_task() {
        let sim = Arc::new(SimulatedDaqmx::new());
        {
            let _task = ScopedTask::create(sim.clone(), "scanner").unwrap();
            assert_eq!(sim.live_tasks(), 1);
        }
        assert_eq!(sim.live_tasks(), 0);
        assert_eq!(sim.count_ops(|op| op == Op::ClearTask), 1);
    }

    #[test]
    fn test_explicit_clear_only_clears_once() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let task = ScopedTask::create(sim.clone(), "clock").unwrap();
        task.clear().unwrap();
        assert_eq!(sim.live_tasks(), 0);
        assert_eq!(sim.count_ops(|op| op == Op::ClearTask), 1);
    }
}
