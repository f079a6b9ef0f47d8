use std::fmt::Debug;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::TaskResult;
use crate::route::PageKind;
use crate::scheduler::TaskSpec;

/// What a post-swap hook gets to see about the page it runs on.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub url: Url,
    pub kind: PageKind,
    pub cancel: CancellationToken,
}

type HookFn = Arc<dyn Fn(HookContext) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Theme code run after every content swap: code highlighting, lazy images,
/// comment widgets, the table of contents.
#[derive(Clone)]
pub struct Hook {
    name: String,
    run: HookFn,
}

impl Hook {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |ctx| run(ctx).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn task_id(&self) -> String {
        format!("hook:{}", self.name)
    }
}

impl Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hook({})", self.name)
    }
}

/// Turns the hooks into a chain of tasks, each depending on the one before
/// it. A failing hook is skipped and the chain goes on.
pub(crate) fn chain(hooks: &[Hook], url: &Url, kind: PageKind) -> Vec<TaskSpec> {
    let mut tasks = Vec::with_capacity(hooks.len());
    let mut previous: Option<String> = None;

    for hook in hooks {
        let run = hook.run.clone();
        let url = url.clone();

        let mut task = TaskSpec::new(hook.task_id(), move |ctx| {
            run(HookContext {
                url: url.clone(),
                kind,
                cancel: ctx.cancel,
            })
        })
        .name(hook.name.clone())
        .skip_on_error();

        if let Some(previous) = previous.take() {
            task = task.depends_on(previous);
        }

        previous = Some(hook.task_id());
        tasks.push(task);
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain() {
        let hooks = vec![
            Hook::new("highlight", |_| async { Ok(()) }),
            Hook::new("toc", |_| async { Ok(()) }),
        ];
        let url = Url::parse("https://b.example/archives/1").unwrap();

        let tasks = chain(&hooks, &url, PageKind::Single);

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id(), "hook:highlight");
        assert!(tasks[0].depends_on.is_empty());
        assert!(tasks[1].depends_on.contains("hook:highlight"));
        assert!(tasks[1].skip_on_error);
    }
}
