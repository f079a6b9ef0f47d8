use std::fmt::Write;
use std::time::Duration;

use serde::Serialize;

use super::task::TaskState;

/// When a task started, relative to the queue's creation, and how long it ran
/// over all its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub start: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub id: String,
    pub name: String,
    pub priority: u8,
    pub depends_on: Vec<String>,
    pub state: TaskState,
    pub attempts: u32,
    pub execution: Option<TaskExecution>,
    pub error: Option<String>,
}

/// One state change of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub task: String,
    pub from: TaskState,
    pub to: TaskState,
    /// Offset from the queue's creation.
    pub at: Duration,
}

/// Snapshot of a queue, as returned by
/// [`TaskQueue::diagnostics`](super::TaskQueue::diagnostics).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    /// Tasks in registration order.
    pub tasks: Vec<TaskReport>,
    pub transitions: Vec<Transition>,
}

impl Diagnostics {
    pub fn task(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by state.
    ///
    /// * **Green**: Completed
    /// * **Yellow**: Skipped
    /// * **Red**: Failed
    /// * **Grey**: Cancelled
    /// * **Blue**: Pending (never reached)
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        for (index, task) in self.tasks.iter().enumerate() {
            let name = task.name.replace('"', "\\\"");
            let label_extra = match task.execution {
                Some(exec) => format!("{:.2?}", exec.duration),
                None => task.state.as_str().to_string(),
            };

            writeln!(f, "    {index}[\"{name}\\n{label_extra}\"]").unwrap();
            writeln!(f, "    style {index} fill:{}", color(task.state)).unwrap();
        }

        for (target, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if let Some(source) = self.tasks.iter().position(|t| &t.id == dep) {
                    writeln!(f, "    {source} --> {target}").unwrap();
                }
            }
        }

        f
    }
}

fn color(state: TaskState) -> &'static str {
    match state {
        TaskState::Completed => "#90EE90",
        TaskState::Skipped => "#FFE08A",
        TaskState::Failed => "#FF7F7F",
        TaskState::Cancelled => "#D3D3D3",
        TaskState::Executing => "#FFB347",
        TaskState::Pending => "#ADD8E6",
    }
}
