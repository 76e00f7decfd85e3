//! Dependency-ordered task execution with on-disk completion records.
//!
//! Tasks are registered with the files they produce and the tasks they wait
//! on, and run lazily when something joins them. A task whose inputs and
//! targets are unchanged since it last completed is skipped, so re-running a
//! pipeline only redoes the work whose inputs or outputs changed.

use crate::error::{PnnError, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const LEDGER_FILE: &str = "completed_tasks.json";

pub type TaskId = usize;
pub type TaskFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Everything about a task except the work itself.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub name: String,
    /// Stable description of the arguments; part of the fingerprint.
    pub args: String,
    /// Files read by the task; a change to any of them forces a rerun.
    pub inputs: Vec<PathBuf>,
    pub targets: Vec<PathBuf>,
    pub dependencies: Vec<TaskId>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn inputs<I, P>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn targets<I, P>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn dependencies(mut self, dependencies: &[TaskId]) -> Self {
        self.dependencies = dependencies.to_vec();
        self
    }

    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.args.as_bytes());
        for input in &self.inputs {
            hasher.update([1u8]);
            hasher.update(input.to_string_lossy().as_bytes());
        }
        for target in &self.targets {
            hasher.update([0u8]);
            hasher.update(target.to_string_lossy().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Skipped,
    Executed,
    Failed,
}

enum TaskState {
    Pending(TaskFn),
    Running,
    Done(TaskStatus),
}

struct Task {
    spec: TaskSpec,
    fingerprint: String,
    state: TaskState,
    /// Input signatures taken when the task was started.
    started_inputs: Vec<FileSignature>,
}

impl Task {
    fn is_pending(&self) -> bool {
        matches!(self.state, TaskState::Pending(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileSignature {
    path: PathBuf,
    size: u64,
    modified_secs: u64,
    modified_nanos: u32,
}

impl FileSignature {
    fn of(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        let modified = metadata.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        Some(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }

    fn is_current(&self) -> bool {
        FileSignature::of(&self.path).as_ref() == Some(self)
    }
}

fn signatures(paths: &[PathBuf]) -> Vec<FileSignature> {
    paths.iter().filter_map(|path| FileSignature::of(path)).collect()
}

fn all_current(recorded: &[FileSignature], paths: &[PathBuf]) -> bool {
    recorded.len() == paths.len()
        && recorded.iter().zip(paths).all(|(sig, path)| &sig.path == path && sig.is_current())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Completion {
    inputs: Vec<FileSignature>,
    targets: Vec<FileSignature>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    completed: BTreeMap<String, Completion>,
}

impl Ledger {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(ledger) => Ok(ledger),
            Err(e) => {
                warn!("Ignoring unreadable task ledger {}: {}", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(tmp.as_file(), self)?;
        tmp.persist(path).map_err(|e| PnnError::Io(e.error))?;
        Ok(())
    }

    fn is_current(&self, fingerprint: &str, spec: &TaskSpec) -> bool {
        match self.completed.get(fingerprint) {
            Some(recorded) => {
                all_current(&recorded.inputs, &spec.inputs)
                    && all_current(&recorded.targets, &spec.targets)
            }
            None => false,
        }
    }
}

pub struct TaskGraph {
    ledger_path: PathBuf,
    ledger: Ledger,
    tasks: Vec<Task>,
    by_fingerprint: BTreeMap<String, TaskId>,
    pool: Option<rayon::ThreadPool>,
}

impl TaskGraph {
    /// `n_workers == 0` runs every task on the calling thread.
    pub fn new<P: AsRef<Path>>(state_dir: P, n_workers: usize) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir)?;
        let ledger_path = state_dir.join(LEDGER_FILE);
        let ledger = Ledger::load(&ledger_path)?;

        let pool = if n_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n_workers)
                    .thread_name(|i| format!("taskgraph-{}", i))
                    .build()
                    .map_err(|e| PnnError::WorkerPool(e.to_string()))?,
            )
        } else {
            None
        };

        debug!(
            "TaskGraph at {} with {} workers ({} completed tasks on record)",
            state_dir.display(),
            n_workers,
            ledger.completed.len()
        );

        Ok(Self {
            ledger_path,
            ledger,
            tasks: Vec::new(),
            by_fingerprint: BTreeMap::new(),
            pool,
        })
    }

    /// Register a task. Registering an identical task again returns the
    /// original id.
    pub fn add_task<F>(&mut self, spec: TaskSpec, func: F) -> Result<TaskId>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if let Some(&dep) = spec.dependencies.iter().find(|&&dep| dep >= self.tasks.len()) {
            return Err(PnnError::UnknownTask(dep));
        }

        let fingerprint = spec.fingerprint();
        if let Some(&existing) = self.by_fingerprint.get(&fingerprint) {
            debug!("Task '{}' already registered as {}", spec.name, existing);
            return Ok(existing);
        }

        let id = self.tasks.len();
        debug!("Registered task {} '{}'", id, spec.name);
        self.by_fingerprint.insert(fingerprint.clone(), id);
        self.tasks.push(Task {
            spec,
            fingerprint,
            state: TaskState::Pending(Box::new(func)),
            started_inputs: Vec::new(),
        });
        Ok(id)
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatus> {
        let task = self.tasks.get(id).ok_or(PnnError::UnknownTask(id))?;
        Ok(match task.state {
            TaskState::Pending(_) | TaskState::Running => TaskStatus::Pending,
            TaskState::Done(status) => status,
        })
    }

    /// Run `id` and whatever it depends on; blocks until done.
    pub fn join_task(&mut self, id: TaskId) -> Result<()> {
        if id >= self.tasks.len() {
            return Err(PnnError::UnknownTask(id));
        }
        if matches!(self.tasks[id].state, TaskState::Done(TaskStatus::Failed)) {
            return Err(PnnError::UpstreamFailed(self.tasks[id].spec.name.clone()));
        }

        let mut needed = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if self.tasks[current].is_pending() && needed.insert(current) {
                stack.extend(self.tasks[current].spec.dependencies.iter().copied());
            }
        }
        self.run(needed)
    }

    /// Run every pending task; blocks until done.
    pub fn join(&mut self) -> Result<()> {
        let needed = (0..self.tasks.len())
            .filter(|&id| self.tasks[id].is_pending())
            .collect();
        self.run(needed)
    }

    /// Persist the completion ledger and release the worker pool.
    pub fn close(self) -> Result<()> {
        self.ledger.save(&self.ledger_path)
    }

    fn run(&mut self, mut needed: BTreeSet<TaskId>) -> Result<()> {
        while !needed.is_empty() {
            let ready: Vec<TaskId> = needed
                .iter()
                .copied()
                .filter(|&id| {
                    self.tasks[id]
                        .spec
                        .dependencies
                        .iter()
                        .all(|&dep| self.succeeded(dep))
                })
                .collect();
            if ready.is_empty() {
                // everything left waits on a task that failed earlier
                let blocked = needed.iter().next().copied().unwrap_or_default();
                return Err(PnnError::UpstreamFailed(self.tasks[blocked].spec.name.clone()));
            }
            for id in &ready {
                needed.remove(id);
            }

            let mut jobs: Vec<(TaskId, TaskFn)> = Vec::new();
            for id in ready {
                if self.can_skip(id) {
                    info!("Skipping '{}', inputs and targets are current", self.tasks[id].spec.name);
                    self.tasks[id].state = TaskState::Done(TaskStatus::Skipped);
                    continue;
                }
                let task = &mut self.tasks[id];
                if let TaskState::Pending(func) = std::mem::replace(&mut task.state, TaskState::Running) {
                    task.started_inputs = signatures(&task.spec.inputs);
                    jobs.push((id, func));
                }
            }

            let results = self.execute(jobs);
            self.finish_wave(results)?;
        }
        Ok(())
    }

    fn succeeded(&self, id: TaskId) -> bool {
        matches!(
            self.tasks[id].state,
            TaskState::Done(TaskStatus::Executed) | TaskState::Done(TaskStatus::Skipped)
        )
    }

    fn can_skip(&self, id: TaskId) -> bool {
        let task = &self.tasks[id];
        if task.spec.targets.is_empty() {
            return false;
        }
        let upstream_ran = task
            .spec
            .dependencies
            .iter()
            .any(|&dep| matches!(self.tasks[dep].state, TaskState::Done(TaskStatus::Executed)));
        !upstream_ran && self.ledger.is_current(&task.fingerprint, &task.spec)
    }

    fn execute(&self, jobs: Vec<(TaskId, TaskFn)>) -> Vec<(TaskId, Result<()>)> {
        for (id, _) in &jobs {
            info!("Running '{}'", self.tasks[*id].spec.name);
        }
        match &self.pool {
            Some(pool) => pool.install(|| {
                jobs.into_par_iter()
                    .map(|(id, func)| (id, func()))
                    .collect()
            }),
            None => jobs.into_iter().map(|(id, func)| (id, func())).collect(),
        }
    }

    fn finish_wave(&mut self, results: Vec<(TaskId, Result<()>)>) -> Result<()> {
        let mut first_error = None;
        for (id, result) in results {
            let outcome = result.and_then(|()| self.record_completion(id));
            let task = &mut self.tasks[id];
            match outcome {
                Ok(()) => task.state = TaskState::Done(TaskStatus::Executed),
                Err(e) => {
                    task.state = TaskState::Done(TaskStatus::Failed);
                    if first_error.is_none() {
                        first_error = Some(PnnError::TaskFailed(task.spec.name.clone(), Box::new(e)));
                    }
                }
            }
        }

        self.ledger.save(&self.ledger_path)?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record_completion(&mut self, id: TaskId) -> Result<()> {
        let task = &self.tasks[id];
        let mut targets = Vec::with_capacity(task.spec.targets.len());
        for target in &task.spec.targets {
            match FileSignature::of(target) {
                Some(sig) => targets.push(sig),
                None => {
                    return Err(PnnError::MissingTarget {
                        task: task.spec.name.clone(),
                        path: target.clone(),
                    })
                }
            }
        }
        let completion = Completion {
            inputs: task.started_inputs.clone(),
            targets,
        };
        let fingerprint = task.fingerprint.clone();
        self.ledger.completed.insert(fingerprint, completion);
        Ok(())
    }
}
