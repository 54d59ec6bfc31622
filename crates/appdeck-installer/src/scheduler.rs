use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use anyhow::Result;
use tracing::{debug, info};

use appdeck_core::{PackageHeader, TaskError};
use appdeck_sudo::SudoClient;

use crate::layout::InstallerPaths;
use crate::locations::LocationRegistry;
use crate::registry::ApplicationRegistry;
use crate::tasks::{
    run_activation, run_deinstallation, run_installation, TaskHooks, TaskKind, TaskSpec,
    TaskState, TaskStatus,
};
use crate::users::UserIdSeparation;

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub trusted_keys: Vec<String>,
    pub allow_unsigned: bool,
    pub development_mode: bool,
    pub hardware_id: String,
    pub user_id_separation: Option<UserIdSeparation>,
}

// Everything a task body needs to do its work, shared across worker threads.
pub(crate) struct TaskEnv {
    pub(crate) sudo: Arc<SudoClient>,
    pub(crate) locations: Arc<LocationRegistry>,
    pub(crate) registry: Arc<dyn ApplicationRegistry>,
    pub(crate) paths: InstallerPaths,
    pub(crate) settings: EngineSettings,
}

// Everything observable about the engine flows through this channel, in the
// order it happened. Listeners must not assume any particular thread.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started {
        task_id: String,
    },
    StateChanged {
        task_id: String,
        state: TaskState,
    },
    Progress {
        task_id: String,
        progress: f64,
    },
    RequestingAcknowledge {
        task_id: String,
        header: PackageHeader,
    },
    Finished {
        task_id: String,
    },
    Failed {
        task_id: String,
        error: TaskError,
    },
}

static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> String {
    format!("task-{}", TASK_COUNTER.fetch_add(1, Ordering::SeqCst))
}

#[derive(Default)]
struct AckFlags {
    acknowledged: bool,
    canceled: bool,
}

struct TaskFlags {
    bits: Mutex<AckFlags>,
    cv: Condvar,
}

struct TaskEntry {
    status: TaskStatus,
    spec: TaskSpec,
    flags: Arc<TaskFlags>,
    // Filled at enqueue time when the request is known to be invalid; such
    // a task fails straight out of the queue without ever starting.
    precheck_error: Option<TaskError>,
}

#[derive(Default)]
struct EngineState {
    queue: VecDeque<String>,
    order: Vec<String>,
    active: Option<String>,
    // Acknowledged tasks waiting to re-enter the slot; they take priority
    // over the queue so an acknowledged installation cannot be starved.
    resume_waiting: usize,
    tasks: HashMap<String, TaskEntry>,
}

struct EngineInner {
    env: TaskEnv,
    state: Mutex<EngineState>,
    slot_cv: Condvar,
    events: Mutex<mpsc::Sender<TaskEvent>>,
}

// The task engine: a FIFO queue of lifecycle tasks in front of a single
// execution slot. Each admitted task runs on its own worker thread; an
// installation waiting for acknowledgement vacates the slot so the next
// task can start fetching, and re-enters it for the Installing phase.
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    pub fn new(
        sudo: Arc<SudoClient>,
        locations: Arc<LocationRegistry>,
        registry: Arc<dyn ApplicationRegistry>,
        paths: InstallerPaths,
        settings: EngineSettings,
        events: mpsc::Sender<TaskEvent>,
    ) -> Result<Self> {
        if let Some(separation) = &settings.user_id_separation {
            separation.validate()?;
        }
        Ok(Self {
            inner: Arc::new(EngineInner {
                env: TaskEnv {
                    sudo,
                    locations,
                    registry,
                    paths,
                    settings,
                },
                state: Mutex::new(EngineState::default()),
                slot_cv: Condvar::new(),
                events: Mutex::new(events),
            }),
        })
    }

    // Queues a package download-and-install. The package is fetched and
    // verified first; the caller must acknowledge() the task after the
    // RequestingAcknowledge event before anything touches the filesystem.
    pub fn enqueue_install(&self, source_url: &str, location_id: Option<&str>) -> String {
        let resolved = match location_id {
            Some(id) => id.to_string(),
            None => self.inner.env.locations.default_location().id(),
        };
        let mut precheck = None;
        if !self.inner.env.locations.by_id(&resolved).is_valid() {
            precheck = Some(TaskError::package(format!(
                "unknown installation location '{resolved}'"
            )));
        } else if source_url.trim().is_empty() {
            precheck = Some(TaskError::package("empty package url".to_string()));
        }
        self.enqueue(
            TaskSpec::Installation {
                location_id: resolved,
                source_url: source_url.to_string(),
            },
            String::new(),
            precheck,
        )
    }

    pub fn enqueue_removal(
        &self,
        application_id: &str,
        keep_documents: bool,
        force: bool,
    ) -> String {
        let precheck = appdeck_core::is_valid_application_id(application_id)
            .err()
            .map(|reason| TaskError::package(format!("invalid application id: {reason}")));
        self.enqueue(
            TaskSpec::Deinstallation {
                application_id: application_id.to_string(),
                keep_documents,
                force,
            },
            application_id.to_string(),
            precheck,
        )
    }

    pub fn enqueue_activation(&self, application_id: &str, activate: bool) -> String {
        let precheck = appdeck_core::is_valid_application_id(application_id)
            .err()
            .map(|reason| TaskError::package(format!("invalid application id: {reason}")));
        self.enqueue(
            TaskSpec::Activation {
                application_id: application_id.to_string(),
                activate,
            },
            application_id.to_string(),
            precheck,
        )
    }

    fn enqueue(
        &self,
        spec: TaskSpec,
        application_id: String,
        precheck_error: Option<TaskError>,
    ) -> String {
        let id = next_task_id();
        let mut state = self.inner.lock_state();
        state.tasks.insert(
            id.clone(),
            TaskEntry {
                status: TaskStatus {
                    id: id.clone(),
                    kind: spec.kind(),
                    state: TaskState::Queued,
                    application_id,
                    progress: 0.0,
                    error: None,
                },
                spec,
                flags: Arc::new(TaskFlags {
                    bits: Mutex::new(AckFlags::default()),
                    cv: Condvar::new(),
                }),
                precheck_error,
            },
        );
        state.order.push(id.clone());
        state.queue.push_back(id.clone());
        let kind = state.tasks[&id].status.kind;
        debug!(target: "installer", task_id = %id, kind = kind.as_str(), "task queued");
        EngineInner::dispatch(&self.inner, &mut state);
        id
    }

    // Lets a task waiting in AwaitingAcknowledge continue into Installing.
    // Calling this before the task gets there is fine; the acknowledgement
    // is remembered and the waiting phase is skipped.
    pub fn acknowledge(&self, task_id: &str) -> bool {
        let state = self.inner.lock_state();
        let Some(entry) = state.tasks.get(task_id) else {
            return false;
        };
        if entry.status.kind != TaskKind::Installation || entry.status.state.is_terminal() {
            return false;
        }
        let flags = entry.flags.clone();
        drop(state);

        flags.bits.lock().expect("task flags lock poisoned").acknowledged = true;
        flags.cv.notify_all();
        true
    }

    // Returns whether the cancellation was accepted. Queued tasks fail
    // synchronously; a fetching or acknowledge-waiting installation is
    // canceled cooperatively; anything past the point of no return reports
    // false and runs to completion.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.inner.lock_state();
        let Some(entry) = state.tasks.get_mut(task_id) else {
            return false;
        };
        match entry.status.state {
            TaskState::Queued => {
                entry.status.state = TaskState::Failed;
                let error = TaskError::canceled();
                entry.status.error = Some(error.clone());
                state.queue.retain(|queued| queued != task_id);
                self.inner.emit(TaskEvent::StateChanged {
                    task_id: task_id.to_string(),
                    state: TaskState::Failed,
                });
                self.inner.emit(TaskEvent::Failed {
                    task_id: task_id.to_string(),
                    error,
                });
                true
            }
            TaskState::Executing if entry.status.kind == TaskKind::Installation => {
                self.inner.mark_canceled(entry);
                true
            }
            TaskState::AwaitingAcknowledge => {
                self.inner.mark_canceled(entry);
                true
            }
            _ => false,
        }
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.status(task_id).map(|status| status.state)
    }

    pub fn task_application_id(&self, task_id: &str) -> Option<String> {
        self.status(task_id).map(|status| status.application_id)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner
            .lock_state()
            .tasks
            .get(task_id)
            .map(|entry| entry.status.clone())
    }

    pub fn active_task_ids(&self) -> Vec<String> {
        let state = self.inner.lock_state();
        state
            .order
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(*id)
                    .is_some_and(|entry| !entry.status.state.is_terminal())
            })
            .cloned()
            .collect()
    }
}

impl EngineInner {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine lock poisoned")
    }

    fn emit(&self, event: TaskEvent) {
        // Listener going away must not break running tasks.
        let _ = self
            .events
            .lock()
            .expect("engine event lock poisoned")
            .send(event);
    }

    fn mark_canceled(&self, entry: &mut TaskEntry) {
        entry.flags.bits.lock().expect("task flags lock poisoned").canceled = true;
        entry.flags.cv.notify_all();
        self.slot_cv.notify_all();
    }

    // Admits the next task when the slot is free and no acknowledged task
    // is waiting to resume. Invalid requests fail here without a Started
    // event.
    fn dispatch(this: &Arc<Self>, state: &mut EngineState) {
        loop {
            if state.active.is_some() || state.resume_waiting > 0 {
                return;
            }
            let Some(id) = state.queue.pop_front() else {
                return;
            };
            let Some(entry) = state.tasks.get_mut(&id) else {
                continue;
            };

            if let Some(error) = entry.precheck_error.take() {
                entry.status.state = TaskState::Failed;
                entry.status.error = Some(error.clone());
                this.emit(TaskEvent::StateChanged {
                    task_id: id.clone(),
                    state: TaskState::Failed,
                });
                this.emit(TaskEvent::Failed { task_id: id, error });
                continue;
            }

            entry.status.state = TaskState::Executing;
            state.active = Some(id.clone());
            this.emit(TaskEvent::Started {
                task_id: id.clone(),
            });
            this.emit(TaskEvent::StateChanged {
                task_id: id.clone(),
                state: TaskState::Executing,
            });

            let inner = Arc::clone(this);
            thread::spawn(move || inner.run_task(id));
            return;
        }
    }

    fn run_task(self: Arc<Self>, id: String) {
        let (spec, flags) = {
            let state = self.lock_state();
            let entry = &state.tasks[&id];
            (entry.spec.clone(), entry.flags.clone())
        };
        let hooks = EngineHooks {
            inner: self.clone(),
            id: id.clone(),
            flags,
        };

        let result = match &spec {
            TaskSpec::Installation {
                location_id,
                source_url,
            } => run_installation(&self.env, &hooks, &id, location_id, source_url),
            TaskSpec::Deinstallation {
                application_id,
                keep_documents,
                force,
            } => run_deinstallation(&self.env, &hooks, application_id, *keep_documents, *force),
            TaskSpec::Activation {
                application_id,
                activate,
            } => run_activation(&self.env, &hooks, application_id, *activate),
        };
        Self::finish_task(&self, &id, result);
    }

    fn finish_task(this: &Arc<Self>, id: &str, result: Result<(), TaskError>) {
        let mut state = this.lock_state();
        if let Some(entry) = state.tasks.get_mut(id) {
            match result {
                Ok(()) => {
                    entry.status.state = TaskState::Finished;
                    entry.status.progress = 1.0;
                    info!(target: "installer", task_id = %id,
                        application_id = %entry.status.application_id, "task finished");
                    this.emit(TaskEvent::StateChanged {
                        task_id: id.to_string(),
                        state: TaskState::Finished,
                    });
                    this.emit(TaskEvent::Finished {
                        task_id: id.to_string(),
                    });
                }
                Err(error) => {
                    entry.status.state = TaskState::Failed;
                    entry.status.error = Some(error.clone());
                    info!(target: "installer", task_id = %id, error = %error, "task failed");
                    this.emit(TaskEvent::StateChanged {
                        task_id: id.to_string(),
                        state: TaskState::Failed,
                    });
                    this.emit(TaskEvent::Failed {
                        task_id: id.to_string(),
                        error,
                    });
                }
            }
        }
        if state.active.as_deref() == Some(id) {
            state.active = None;
        }
        this.slot_cv.notify_all();
        Self::dispatch(this, &mut state);
    }
}

struct EngineHooks {
    inner: Arc<EngineInner>,
    id: String,
    flags: Arc<TaskFlags>,
}

impl TaskHooks for EngineHooks {
    fn set_state(&self, state: TaskState) {
        let mut engine_state = self.inner.lock_state();
        if let Some(entry) = engine_state.tasks.get_mut(&self.id) {
            entry.status.state = state;
        }
        self.inner.emit(TaskEvent::StateChanged {
            task_id: self.id.clone(),
            state,
        });
    }

    fn set_progress(&self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        let mut engine_state = self.inner.lock_state();
        let Some(entry) = engine_state.tasks.get_mut(&self.id) else {
            return;
        };
        // Progress never goes backwards, whatever the transfer layer says.
        if progress <= entry.status.progress {
            return;
        }
        entry.status.progress = progress;
        self.inner.emit(TaskEvent::Progress {
            task_id: self.id.clone(),
            progress,
        });
    }

    fn set_application_id(&self, application_id: &str) {
        let mut engine_state = self.inner.lock_state();
        if let Some(entry) = engine_state.tasks.get_mut(&self.id) {
            entry.status.application_id = application_id.to_string();
        }
    }

    fn check_canceled(&self) -> Result<(), TaskError> {
        if self.flags.bits.lock().expect("task flags lock poisoned").canceled {
            return Err(TaskError::canceled());
        }
        Ok(())
    }

    fn await_acknowledge(&self, header: &PackageHeader) -> Result<(), TaskError> {
        {
            let mut state = self.inner.lock_state();
            if let Some(entry) = state.tasks.get_mut(&self.id) {
                entry.status.state = TaskState::AwaitingAcknowledge;
            }
            self.inner.emit(TaskEvent::StateChanged {
                task_id: self.id.clone(),
                state: TaskState::AwaitingAcknowledge,
            });
            self.inner.emit(TaskEvent::RequestingAcknowledge {
                task_id: self.id.clone(),
                header: header.clone(),
            });
            // Vacate the slot so the next queued task can start fetching.
            if state.active.as_deref() == Some(self.id.as_str()) {
                state.active = None;
            }
            self.inner.slot_cv.notify_all();
            EngineInner::dispatch(&self.inner, &mut state);
        }

        {
            let mut bits = self.flags.bits.lock().expect("task flags lock poisoned");
            while !bits.acknowledged && !bits.canceled {
                bits = self
                    .flags
                    .cv
                    .wait(bits)
                    .expect("task flags lock poisoned");
            }
            if bits.canceled {
                return Err(TaskError::canceled());
            }
        }

        let mut state = self.inner.lock_state();
        state.resume_waiting += 1;
        while state.active.is_some() {
            if self.flags.bits.lock().expect("task flags lock poisoned").canceled {
                state.resume_waiting -= 1;
                EngineInner::dispatch(&self.inner, &mut state);
                return Err(TaskError::canceled());
            }
            state = self
                .inner
                .slot_cv
                .wait(state)
                .expect("engine lock poisoned");
        }
        state.resume_waiting -= 1;
        state.active = Some(self.id.clone());
        if let Some(entry) = state.tasks.get_mut(&self.id) {
            entry.status.state = TaskState::Installing;
        }
        self.inner.emit(TaskEvent::StateChanged {
            task_id: self.id.clone(),
            state: TaskState::Installing,
        });
        Ok(())
    }
}
