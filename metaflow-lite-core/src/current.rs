use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Immutable snapshot of the ambient task context, bound once per task
/// attempt before user code runs and torn down after.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskContext {
    pub flow_name: String,
    pub run_id: String,
    pub step_name: String,
    pub task_id: String,
    pub retry_count: u32,
    pub origin_run_id: Option<String>,
    pub namespace: Option<String>,
    pub username: String,
    pub user_tags: Vec<String>,
    pub sys_tags: Vec<String>,
    pub parallel_num_nodes: usize,
    pub parallel_node_index: usize,
    pub project_name: Option<String>,
    pub branch_name: Option<String>,
    pub project_flow_name: Option<String>,
    pub is_production: bool,
}

impl TaskContext {
    /// `Flow/Run/Step/Task` string, when all four parts are bound.
    pub fn pathspec(&self) -> Option<String> {
        if self.flow_name.is_empty()
            || self.run_id.is_empty()
            || self.step_name.is_empty()
            || self.task_id.is_empty()
        {
            return None;
        }
        Some(format!(
            "{}/{}/{}/{}",
            self.flow_name, self.run_id, self.step_name, self.task_id
        ))
    }

    /// Control tasks are the authoritative member of a parallel group.
    pub fn is_control_task(&self) -> bool {
        self.parallel_num_nodes > 1 && self.parallel_node_index == 0
    }
}

thread_local! {
    static CURRENT: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
}

/// Bind the ambient context for this thread.
pub fn bind(ctx: TaskContext) {
    CURRENT.with(|c| *c.borrow_mut() = Some(ctx));
}

/// Update only the retry count, between attempts of the same task.
pub fn bind_retry(retry_count: u32) {
    CURRENT.with(|c| {
        if let Some(ctx) = c.borrow_mut().as_mut() {
            ctx.retry_count = retry_count;
        }
    });
}

/// Snapshot of the currently bound context, if any.
pub fn get() -> Option<TaskContext> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Tear down the binding after a task completes.
pub fn clear() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}
