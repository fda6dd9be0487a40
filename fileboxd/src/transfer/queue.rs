use super::task::{Direction, TaskId, TaskStatus, TransferSpec, TransferTask};

/// Generation of one activation of the current task.
///
/// Every (re)start bumps the run, so completions and progress from a worker
/// that was cancelled can be told apart from the one that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunId(u64);

#[cfg(test)]
impl RunId {
    pub(crate) fn for_tests(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub run: RunId,
    pub task: TransferTask,
    /// Set when a cancelled task was put back under a fresh id.
    pub requeued_from: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub task: TransferTask,
    /// Progress jumped to 100 on completion rather than being reported by the worker.
    pub reached_full: bool,
    pub next: Option<Activation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub task: TransferTask,
    pub was_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub direction: Direction,
    pub tasks: Vec<TransferTask>,
    pub current: Option<usize>,
    pub busy: bool,
    pub progress: u8,
}

impl QueueSnapshot {
    pub fn pending(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .count()
    }

    pub fn active(&self) -> Option<&TransferTask> {
        if !self.busy {
            return None;
        }
        self.current.and_then(|index| self.tasks.get(index))
    }
}

/// Sequential transfer queue. At most one task is active at a time and
/// tasks run in the order they were enqueued.
///
/// Finished tasks stay in the list until the run drains, at which point the
/// list is cleared and the queue goes idle.
#[derive(Debug)]
pub struct TransferQueue {
    direction: Direction,
    tasks: Vec<TransferTask>,
    current: Option<usize>,
    busy: bool,
    next_id: u64,
    run: u64,
}

impl TransferQueue {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            tasks: Vec::new(),
            current: None,
            busy: false,
            next_id: 1,
            run: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// True when a task for the same source is still pending or active.
    pub fn is_queued(&self, spec: &TransferSpec) -> bool {
        self.tasks
            .iter()
            .any(|task| !task.status.is_terminal() && task.spec.same_source(spec))
    }

    /// Appends tasks and, when idle, activates the oldest pending one.
    pub fn enqueue(&mut self, specs: Vec<TransferSpec>) -> (Vec<TaskId>, Option<Activation>) {
        let first_new = self.tasks.len();
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = TaskId(self.next_id);
            self.next_id += 1;
            self.tasks.push(TransferTask {
                id,
                spec,
                progress: 0,
                status: TaskStatus::Pending,
            });
            ids.push(id);
        }

        if self.busy || ids.is_empty() {
            return (ids, None);
        }
        let index = self
            .current
            .and_then(|current| self.first_pending_from(current))
            .unwrap_or(first_new);
        self.current = Some(index);
        let activation = self.activate();
        (ids, activation)
    }

    /// Activates the task at the current index. A cancelled task there is
    /// replaced by a fresh pending copy with a new id, so the cancelled one
    /// stays terminal. No-op while a task is active or when the queue is empty.
    pub fn start(&mut self) -> Option<Activation> {
        if self.busy || self.tasks.is_empty() {
            return None;
        }
        let index = match self.current {
            Some(index) if index < self.tasks.len() => index,
            _ => 0,
        };
        self.current = Some(index);
        let requeued_from = self.requeue_cancelled(index);
        let mut activation = self.activate()?;
        activation.requeued_from = requeued_from;
        Some(activation)
    }

    /// Records worker progress. Returns the new value only when it moved forward.
    pub fn record_progress(&mut self, run: RunId, percent: u8) -> Option<u8> {
        let task = self.active_task_mut(run)?;
        let percent = percent.min(100);
        if percent <= task.progress {
            return None;
        }
        task.progress = percent;
        Some(percent)
    }

    /// Settles the active task and advances to the next one.
    /// Returns `None` for completions of a stale run.
    pub fn finish(&mut self, run: RunId, outcome: Result<(), String>) -> Option<Completion> {
        let task = self.active_task_mut(run)?;
        let reached_full = match outcome {
            Ok(()) => {
                let jumped = task.progress < 100;
                task.progress = 100;
                task.status = TaskStatus::Succeeded;
                jumped
            }
            Err(error) => {
                task.status = TaskStatus::Failed { error };
                false
            }
        };
        let task = task.clone();
        self.busy = false;
        let next = self.advance();
        Some(Completion {
            task,
            reached_full,
            next,
        })
    }

    /// Moves to the next task, clearing the queue once past the tail.
    pub fn advance(&mut self) -> Option<Activation> {
        let next = self.current.map_or(0, |index| index + 1);
        if next >= self.tasks.len() {
            self.clear();
            return None;
        }
        self.current = Some(next);
        self.activate()
    }

    /// Marks the active task cancelled and leaves the queue idle on it.
    pub fn cancel_active(&mut self) -> Option<TransferTask> {
        if !self.busy {
            return None;
        }
        let task = self.tasks.get_mut(self.current?)?;
        task.status = TaskStatus::Cancelled;
        task.progress = 0;
        let task = task.clone();
        self.busy = false;
        Some(task)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Removal> {
        let index = self.tasks.iter().position(|task| task.id == id)?;
        let was_active = self.busy && self.current == Some(index);
        if was_active {
            self.cancel_active();
        }
        let task = self.tasks.remove(index);

        if let Some(current) = self.current {
            let current = if index < current { current - 1 } else { current };
            if current >= self.tasks.len() {
                self.clear();
            } else {
                self.current = Some(current);
            }
        }
        Some(Removal { task, was_active })
    }

    pub fn cancel_all(&mut self) -> Option<TransferTask> {
        let cancelled = self.cancel_active();
        self.clear();
        cancelled
    }

    pub fn active_task(&self) -> Option<&TransferTask> {
        if !self.busy {
            return None;
        }
        self.current.and_then(|index| self.tasks.get(index))
    }

    /// Progress of the active task, 0 while idle.
    pub fn progress(&self) -> u8 {
        if !self.busy {
            return 0;
        }
        self.current
            .and_then(|index| self.tasks.get(index))
            .map_or(0, |task| task.progress)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            direction: self.direction,
            tasks: self.tasks.clone(),
            current: self.current,
            busy: self.busy,
            progress: self.progress(),
        }
    }

    fn activate(&mut self) -> Option<Activation> {
        let task = self.tasks.get_mut(self.current?)?;
        task.status = TaskStatus::Active;
        task.progress = 0;
        self.run += 1;
        self.busy = true;
        Some(Activation {
            run: RunId(self.run),
            task: task.clone(),
            requeued_from: None,
        })
    }

    fn requeue_cancelled(&mut self, index: usize) -> Option<TaskId> {
        let id = TaskId(self.next_id);
        let task = self.tasks.get_mut(index)?;
        if task.status != TaskStatus::Cancelled {
            return None;
        }
        let cancelled = std::mem::replace(&mut task.id, id);
        task.status = TaskStatus::Pending;
        task.progress = 0;
        self.next_id += 1;
        Some(cancelled)
    }

    fn active_task_mut(&mut self, run: RunId) -> Option<&mut TransferTask> {
        if !self.busy || run.0 != self.run {
            return None;
        }
        self.tasks.get_mut(self.current?)
    }

    fn first_pending_from(&self, start: usize) -> Option<usize> {
        (start..self.tasks.len()).find(|&index| self.tasks[index].status == TaskStatus::Pending)
    }

    fn clear(&mut self) {
        self.tasks.clear();
        self.current = None;
        self.busy = false;
    }
}
