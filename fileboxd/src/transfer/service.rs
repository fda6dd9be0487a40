use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{ProgressSink, TransferExecutor, WorkerMessage};
use super::queue::{Activation, Completion, QueueSnapshot, TransferQueue};
use super::task::{
    Direction, TaskId, TaskStatus, TransferLimits, TransferRequest, TransferSpec, TransferTask,
    ValidationError, validate,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Queued {
        direction: Direction,
        task_id: TaskId,
        name: String,
    },
    Rejected {
        direction: Direction,
        source: String,
        reason: String,
    },
    Started {
        direction: Direction,
        task_id: TaskId,
        name: String,
    },
    Progress {
        direction: Direction,
        task_id: TaskId,
        percent: u8,
    },
    Succeeded {
        direction: Direction,
        task_id: TaskId,
        message: String,
    },
    Failed {
        direction: Direction,
        task_id: TaskId,
        error: String,
    },
    Cancelled {
        direction: Direction,
        task_id: TaskId,
    },
    Removed {
        direction: Direction,
        task_id: TaskId,
    },
    ProgressReset {
        direction: Direction,
    },
    Idle {
        direction: Direction,
    },
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Succeeded { .. }
                | TransferEvent::Failed { .. }
                | TransferEvent::Cancelled { .. }
        )
    }
}

#[derive(Debug, Error)]
#[error("{0} queue is no longer running")]
pub struct QueueClosed(pub Direction);

enum QueueCommand {
    Enqueue(Vec<TransferRequest>),
    Start,
    CancelActive,
    Remove(TaskId),
    CancelAll,
    Snapshot(oneshot::Sender<QueueSnapshot>),
}

/// Front-end side of a transfer queue.
#[derive(Clone)]
pub struct TransferHandle {
    direction: Direction,
    commands: mpsc::UnboundedSender<QueueCommand>,
    events: broadcast::Sender<TransferEvent>,
}

impl TransferHandle {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn enqueue(&self, requests: Vec<TransferRequest>) -> Result<(), QueueClosed> {
        self.send(QueueCommand::Enqueue(requests))
    }

    pub fn start(&self) -> Result<(), QueueClosed> {
        self.send(QueueCommand::Start)
    }

    pub fn cancel_active(&self) -> Result<(), QueueClosed> {
        self.send(QueueCommand::CancelActive)
    }

    pub fn remove(&self, task_id: TaskId) -> Result<(), QueueClosed> {
        self.send(QueueCommand::Remove(task_id))
    }

    pub fn cancel_all(&self) -> Result<(), QueueClosed> {
        self.send(QueueCommand::CancelAll)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, QueueClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Snapshot(reply))?;
        rx.await.map_err(|_| QueueClosed(self.direction))
    }

    fn send(&self, command: QueueCommand) -> Result<(), QueueClosed> {
        self.commands
            .send(command)
            .map_err(|_| QueueClosed(self.direction))
    }
}

/// Spawns the task that owns one queue. It stops once every handle is dropped.
pub fn spawn_transfer_queue<E: TransferExecutor>(
    direction: Direction,
    executor: E,
    limits: TransferLimits,
) -> (TransferHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let actor = QueueActor {
        queue: TransferQueue::new(direction),
        executor: Arc::new(executor),
        limits,
        events: events.clone(),
        worker_tx,
        worker: None,
    };
    let handle = TransferHandle {
        direction,
        commands: commands_tx,
        events,
    };
    (handle, tokio::spawn(actor.run(commands_rx, worker_rx)))
}

struct QueueActor<E> {
    queue: TransferQueue,
    executor: Arc<E>,
    limits: TransferLimits,
    events: broadcast::Sender<TransferEvent>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    worker: Option<CancellationToken>,
}

impl<E: TransferExecutor> QueueActor<E> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<QueueCommand>,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = worker_rx.recv() => self.handle_worker(message),
            }
        }
        self.stop_worker();
        debug!(direction = %self.direction(), "transfer queue stopped");
    }

    fn direction(&self) -> Direction {
        self.queue.direction()
    }

    async fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Enqueue(requests) => self.enqueue(requests).await,
            QueueCommand::Start => {
                if let Some(activation) = self.queue.start() {
                    self.launch(activation);
                }
            }
            QueueCommand::CancelActive => {
                if let Some(task) = self.queue.cancel_active() {
                    self.cancelled(&task);
                    self.emit(TransferEvent::Idle {
                        direction: self.direction(),
                    });
                }
            }
            QueueCommand::Remove(task_id) => self.remove(task_id),
            QueueCommand::CancelAll => {
                let had_tasks = !self.queue.is_empty();
                if let Some(task) = self.queue.cancel_all() {
                    self.cancelled(&task);
                }
                if had_tasks {
                    info!(direction = %self.direction(), "transfer queue cleared");
                    self.emit(TransferEvent::Idle {
                        direction: self.direction(),
                    });
                }
            }
            QueueCommand::Snapshot(reply) => {
                let _ = reply.send(self.queue.snapshot());
            }
        }
    }

    async fn enqueue(&mut self, requests: Vec<TransferRequest>) {
        let direction = self.direction();
        let mut accepted: Vec<TransferSpec> = Vec::with_capacity(requests.len());

        for request in requests {
            let source = request.source();
            if request.direction() != direction {
                self.reject(source, format!("expected {direction} request"));
                continue;
            }
            match validate(request, &self.limits).await {
                Ok(spec)
                    if self.queue.is_queued(&spec)
                        || accepted.iter().any(|queued| queued.same_source(&spec)) =>
                {
                    let reason = ValidationError::AlreadyQueued(spec.file_name()).to_string();
                    self.reject(source, reason);
                }
                Ok(spec) => accepted.push(spec),
                Err(err) => self.reject(source, err.to_string()),
            }
        }

        let names: Vec<String> = accepted.iter().map(TransferSpec::file_name).collect();
        let (ids, started) = self.queue.enqueue(accepted);
        for (task_id, name) in ids.into_iter().zip(names) {
            debug!(%direction, task = %task_id, %name, "transfer queued");
            self.emit(TransferEvent::Queued {
                direction,
                task_id,
                name,
            });
        }
        if let Some(activation) = started {
            self.launch(activation);
        }
    }

    fn remove(&mut self, task_id: TaskId) {
        let Some(removal) = self.queue.remove(task_id) else {
            debug!(direction = %self.direction(), task = %task_id, "remove of unknown task ignored");
            return;
        };
        if removal.was_active {
            self.cancelled(&removal.task);
        }
        self.emit(TransferEvent::Removed {
            direction: self.direction(),
            task_id,
        });
        if removal.was_active {
            self.emit(TransferEvent::Idle {
                direction: self.direction(),
            });
        }
    }

    fn launch(&mut self, activation: Activation) {
        self.stop_worker();
        let Activation {
            run,
            task,
            requeued_from,
        } = activation;
        let direction = self.direction();
        if let Some(previous) = requeued_from {
            debug!(%direction, task = %task.id, %previous, "cancelled transfer requeued");
            self.emit(TransferEvent::Queued {
                direction,
                task_id: task.id,
                name: task.name(),
            });
        }
        info!(%direction, task = %task.id, name = %task.name(), "transfer started");
        self.emit(TransferEvent::Started {
            direction,
            task_id: task.id,
            name: task.name(),
        });

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let executor = Arc::clone(&self.executor);
        let tx = self.worker_tx.clone();
        let progress = ProgressSink::new(run, tx.clone());
        let spec = task.spec;
        tokio::spawn(async move {
            tokio::select! {
                result = executor.execute(&spec, progress) => {
                    let _ = tx.send(WorkerMessage::Done { run, result });
                }
                () = cancelled.cancelled() => {}
            }
        });
        self.worker = Some(token);
    }

    fn handle_worker(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Progress { run, percent } => {
                let Some(percent) = self.queue.record_progress(run, percent) else {
                    return;
                };
                if let Some(task) = self.queue.active_task() {
                    let event = TransferEvent::Progress {
                        direction: self.direction(),
                        task_id: task.id,
                        percent,
                    };
                    self.emit(event);
                }
            }
            WorkerMessage::Done { run, result } => {
                let outcome = result.map_err(|err| err.to_string());
                match self.queue.finish(run, outcome) {
                    Some(completion) => self.completed(completion),
                    None => debug!(direction = %self.direction(), "stale transfer result ignored"),
                }
            }
        }
    }

    fn completed(&mut self, completion: Completion) {
        self.worker = None;
        let direction = self.direction();
        let Completion {
            task,
            reached_full,
            next,
        } = completion;

        match &task.status {
            TaskStatus::Succeeded => {
                if reached_full {
                    self.emit(TransferEvent::Progress {
                        direction,
                        task_id: task.id,
                        percent: 100,
                    });
                }
                let message = success_message(&task);
                info!(%direction, task = %task.id, "{message}");
                self.emit(TransferEvent::Succeeded {
                    direction,
                    task_id: task.id,
                    message,
                });
            }
            TaskStatus::Failed { error } => {
                warn!(%direction, task = %task.id, name = %task.name(), "transfer failed: {error}");
                self.emit(TransferEvent::Failed {
                    direction,
                    task_id: task.id,
                    error: error.clone(),
                });
            }
            _ => {}
        }
        self.emit(TransferEvent::ProgressReset { direction });

        match next {
            Some(activation) => self.launch(activation),
            None => {
                info!(%direction, "transfer queue drained");
                self.emit(TransferEvent::Idle { direction });
            }
        }
    }

    fn cancelled(&mut self, task: &TransferTask) {
        self.stop_worker();
        let direction = self.direction();
        info!(%direction, task = %task.id, name = %task.name(), "transfer cancelled");
        self.emit(TransferEvent::Cancelled {
            direction,
            task_id: task.id,
        });
        self.emit(TransferEvent::ProgressReset { direction });
    }

    fn reject(&self, source: String, reason: String) {
        warn!(direction = %self.direction(), %source, "transfer rejected: {reason}");
        self.emit(TransferEvent::Rejected {
            direction: self.direction(),
            source,
            reason,
        });
    }

    fn stop_worker(&mut self) {
        if let Some(token) = self.worker.take() {
            token.cancel();
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

fn success_message(task: &TransferTask) -> String {
    match &task.spec {
        TransferSpec::Upload { .. } => format!("uploaded '{}'", task.name()),
        TransferSpec::Download { save_path, .. } => {
            format!("downloaded '{}' to {}", task.name(), save_path.display())
        }
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
