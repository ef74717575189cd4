//! Test tasks, executables, and queue listeners.

use async_trait::async_trait;
use crucible_core::build::{CompletedBuild, Outcome};
use crucible_core::ids::TaskId;
use crucible_core::label::LabelExpr;
use crucible_core::task::{Executable, ExecutionContext, SubTask, Task};
use crucible_core::Result;
use crucible_scheduler::item::LeftItem;
use crucible_scheduler::queue::QueueListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a [`TestTask`]'s executable does when it runs.
#[derive(Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Wait for the cancellation token, then acknowledge the abort.
    BlockUntilCancelled,
    /// Ignore the cancellation token entirely.
    Unresponsive,
    Sleep(Duration),
}

/// Configurable task for exercising the queue and executors.
pub struct TestTask {
    id: String,
    label: Option<String>,
    concurrent: bool,
    behavior: Behavior,
    runs: Arc<AtomicUsize>,
    sub_names: Vec<String>,
    trace: Option<Arc<Mutex<Vec<String>>>>,
}

impl TestTask {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            concurrent: false,
            behavior: Behavior::Succeed,
            runs: Arc::new(AtomicUsize::new(0)),
            sub_names: Vec::new(),
            trace: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Add named sub-tasks; each records into the trace when run.
    pub fn with_sub_tasks(mut self, names: &[&str]) -> Self {
        self.sub_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Record executable names into the given trace as they run.
    pub fn with_trace(mut self, trace: Arc<Mutex<Vec<String>>>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// How many times this task's executables have run.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn run_counter(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }
}

impl Task for TestTask {
    fn id(&self) -> TaskId {
        TaskId::new(self.id.clone())
    }

    fn assigned_label(&self) -> Option<LabelExpr> {
        self.label
            .as_ref()
            .map(|l| LabelExpr::parse(l).expect("valid test label"))
    }

    fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    fn sub_tasks(&self) -> Vec<Arc<dyn SubTask>> {
        self.sub_names
            .iter()
            .map(|name| {
                Arc::new(TestSubTask {
                    name: name.clone(),
                    behavior: self.behavior,
                    runs: self.runs.clone(),
                    trace: self.trace.clone(),
                }) as Arc<dyn SubTask>
            })
            .collect()
    }

    fn create_executable(&self) -> Result<Box<dyn Executable>> {
        Ok(Box::new(TestExecutable {
            name: self.id.clone(),
            behavior: self.behavior,
            runs: self.runs.clone(),
            trace: self.trace.clone(),
        }))
    }
}

struct TestSubTask {
    name: String,
    behavior: Behavior,
    runs: Arc<AtomicUsize>,
    trace: Option<Arc<Mutex<Vec<String>>>>,
}

impl SubTask for TestSubTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn create_executable(&self) -> Result<Box<dyn Executable>> {
        Ok(Box::new(TestExecutable {
            name: self.name.clone(),
            behavior: self.behavior,
            runs: self.runs.clone(),
            trace: self.trace.clone(),
        }))
    }
}

struct TestExecutable {
    name: String,
    behavior: Behavior,
    runs: Arc<AtomicUsize>,
    trace: Option<Arc<Mutex<Vec<String>>>>,
}

#[async_trait]
impl Executable for TestExecutable {
    async fn run(&self, ctx: &ExecutionContext) -> Outcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(trace) = &self.trace {
            trace.lock().unwrap().push(self.name.clone());
        }
        match self.behavior {
            Behavior::Succeed => Outcome::Success,
            Behavior::Fail => {
                ctx.log.append(format!("{} failed", self.name));
                Outcome::Failure
            }
            Behavior::BlockUntilCancelled => {
                ctx.token.cancelled().await;
                Outcome::Aborted
            }
            Behavior::Unresponsive => loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            },
            Behavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Outcome::Success
            }
        }
    }
}

/// Captures every build that leaves the queue.
#[derive(Default)]
pub struct BuildCapture {
    builds: Mutex<Vec<CompletedBuild>>,
}

impl BuildCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn builds(&self) -> Vec<CompletedBuild> {
        self.builds.lock().unwrap().clone()
    }

    pub fn build_for(&self, task: &TaskId) -> Option<CompletedBuild> {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.task == *task)
            .cloned()
    }
}

impl QueueListener for BuildCapture {
    fn on_left(&self, item: &LeftItem) -> Result<()> {
        if let Some(build) = &item.build {
            self.builds.lock().unwrap().push(build.clone());
        }
        Ok(())
    }
}
