//! Durable task queue: an mpsc-fed loop spawning one worker thread per
//! task, throttled by an atomic counter, with every queued task mirrored
//! into a JSON dump so interrupted work survives a restart.

use std::{
    sync::{
        atomic::{AtomicU16, Ordering},
        mpsc, Arc, RwLock,
    },
    thread::sleep,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rand::random;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    eid::Eid,
    requirements::AuditStatus,
    storage::StorageManager,
};

use super::audit::PipelineCore;
use super::errors::PipelineError;

const QUEUE_DUMP_FILE: &str = "task-queue.json";

pub fn now() -> u128 {
    let start = SystemTime::now();
    let since_the_epoch = start
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");
    since_the_epoch.as_millis()
}

pub fn throttle(counter: Arc<AtomicU16>, config: Arc<RwLock<Config>>) {
    while counter.load(Ordering::Relaxed) >= config.read().unwrap().task_queue_max_threads {
        sleep(Duration::from_millis(100));
    }
}

pub fn start_queue(
    task_rx: mpsc::Receiver<Task>,
    core: Arc<PipelineCore>,
    storage_mgr: Arc<dyn StorageManager>,
    config: Arc<RwLock<Config>>,
) {
    let thread_ctr = Arc::new(AtomicU16::new(0));

    log::debug!("waiting for job");
    while let Ok(task) = task_rx.recv() {
        log::debug!("got the job");
        let core = core.clone();
        let storage_mgr = storage_mgr.clone();
        let thread_counter = thread_ctr.clone();

        let config = config.clone();

        // graceful shutdown
        if let Task::Shutdown = &task {
            while thread_counter.load(Ordering::Relaxed) > 0 {
                sleep(Duration::from_millis(100));
            }
            return;
        };

        let id = save_task(storage_mgr.clone(), task.clone(), Status::Pending);
        let task_handle = std::thread::spawn({
            let thread_counter = thread_counter.clone();
            let id = id.clone();
            let storage_mgr = storage_mgr.clone();
            move || {
                throttle(thread_counter.clone(), config.clone());

                thread_counter.fetch_add(1, Ordering::Relaxed);
                set_status(storage_mgr.clone(), id.clone(), Status::InProgress);

                let max_retries = config.read().unwrap().task_queue_max_retries;
                let mut attempt = 0u8;

                loop {
                    match task.run(core.clone(), config.clone()) {
                        Ok(status) => {
                            set_status(storage_mgr.clone(), id.clone(), status);
                            break;
                        }
                        Err(err) if attempt < max_retries && err.is_retryable() => {
                            attempt += 1;
                            let delay_ms = 5000 * 2u64.pow(attempt as u32 - 1) + rand_jitter();
                            log::info!(
                                "task {}: retrying (attempt {}/{}) after error: {}, backoff {}ms",
                                id,
                                attempt,
                                max_retries,
                                err,
                                delay_ms
                            );
                            set_attempt(storage_mgr.clone(), id.clone(), attempt);
                            set_status(storage_mgr.clone(), id.clone(), Status::Pending);
                            sleep(Duration::from_millis(delay_ms));
                        }
                        Err(err) => {
                            log::error!("task {id} failed: {err}");
                            task.rollback(&core);
                            set_status(storage_mgr.clone(), id.clone(), Status::Error(err.to_string()));
                            break;
                        }
                    }
                }

                // remove task a bit later to give client an opportunity to react
                std::thread::spawn(move || {
                    sleep(Duration::from_secs(10));
                    remove_task(storage_mgr, id);
                });
            }
        });

        // handle thread panics
        std::thread::spawn(move || {
            if let Err(err) = task_handle.join() {
                log::error!("task_handle panicked: {err:?}");
                remove_task(storage_mgr, id);
            }

            thread_counter.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

pub fn read_queue_dump(storage_mgr: &Arc<dyn StorageManager>) -> QueueDump {
    if storage_mgr.exists(QUEUE_DUMP_FILE) {
        match storage_mgr.read(QUEUE_DUMP_FILE) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                log::error!("queue dump is malformed, starting empty: {e}");
                QueueDump {
                    queue: vec![],
                    now: now(),
                }
            }),
            Err(e) => {
                log::error!("failed to read queue dump: {e}");
                QueueDump {
                    queue: vec![],
                    now: now(),
                }
            }
        }
    } else {
        QueueDump {
            queue: vec![],
            now: now(),
        }
    }
}

pub fn write_queue_dump(storage_mgr: &Arc<dyn StorageManager>, queue_dump: &QueueDump) {
    let queue_dump_str = match serde_json::to_string_pretty(&queue_dump) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to serialize queue dump: {e}");
            return;
        }
    };
    if let Err(e) = storage_mgr.write(QUEUE_DUMP_FILE, queue_dump_str.as_bytes()) {
        log::error!("failed to write queue dump: {e}");
    }
}

pub fn remove_task(storage_mgr: Arc<dyn StorageManager>, id: Eid) {
    let mut queue_dump = read_queue_dump(&storage_mgr);
    queue_dump.queue.retain(|td| td.id != id);
    queue_dump.now = now();
    write_queue_dump(&storage_mgr, &queue_dump);
}

pub fn set_status(storage_mgr: Arc<dyn StorageManager>, id: Eid, status: Status) {
    let mut queue_dump = read_queue_dump(&storage_mgr);
    if let Some(task_dump) = queue_dump.queue.iter_mut().find(|td| td.id == id) {
        task_dump.status = status;
    }

    queue_dump.now = now();
    write_queue_dump(&storage_mgr, &queue_dump);
}

fn set_attempt(storage_mgr: Arc<dyn StorageManager>, id: Eid, attempt: u8) {
    let mut queue_dump = read_queue_dump(&storage_mgr);
    if let Some(task_dump) = queue_dump.queue.iter_mut().find(|td| td.id == id) {
        task_dump.attempt = attempt;
    }
    queue_dump.now = now();
    write_queue_dump(&storage_mgr, &queue_dump);
}

fn rand_jitter() -> u64 {
    random::<u64>() % 2000
}

pub fn save_task(storage_mgr: Arc<dyn StorageManager>, task: Task, status: Status) -> Eid {
    let eid = Eid::new();

    let task_dump = TaskDump {
        id: eid.clone(),
        task,
        status,
        attempt: 0,
    };

    let mut queue_dump = read_queue_dump(&storage_mgr);

    queue_dump.queue.push(task_dump);
    queue_dump.now = now();
    write_queue_dump(&storage_mgr, &queue_dump);

    eid
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Status {
    Interrupted,
    Pending,
    InProgress,
    Done,
    Error(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueDump {
    pub queue: Vec<TaskDump>,
    pub now: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDump {
    pub id: Eid,
    pub task: Task,
    pub status: Status,
    #[serde(default)]
    pub attempt: u8,
}

/// Counts reported by a finished vectorization unit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskReport {
    pub vectorized: usize,
    pub skipped: usize,
    pub failed: usize,
    pub relations_created: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Task {
    /// request to vectorize a batch of in-flight requirements and build
    /// relations over the successful subset
    VectorizeBatch { requirement_ids: Vec<u64> },

    /// request to gracefully shutdown task queue
    Shutdown,
}

impl Task {
    pub fn run(
        &self,
        core: Arc<PipelineCore>,
        config: Arc<RwLock<Config>>,
    ) -> Result<Status, PipelineError> {
        match self {
            Task::VectorizeBatch { requirement_ids } => {
                log::debug!("picked up a job...");
                let report = core.run_vectorize_batch(requirement_ids, config)?;
                log::info!(
                    "vectorize batch done: {} vectorized, {} skipped, {} failed, {} relations",
                    report.vectorized,
                    report.skipped,
                    report.failed,
                    report.relations_created
                );
                Ok(Status::Done)
            }
            Task::Shutdown => unreachable!(),
        }
    }

    /// Per-id commit: on exhaustion or a non-retryable failure only ids
    /// still in flight revert to pending; ids an earlier attempt already
    /// confirmed keep their state.
    pub fn rollback(&self, core: &PipelineCore) {
        match self {
            Task::VectorizeBatch { requirement_ids } => {
                match core.requirements.transition_each(
                    requirement_ids,
                    AuditStatus::InFlight,
                    AuditStatus::Pending,
                ) {
                    Ok(reverted) if !reverted.is_empty() => {
                        log::warn!("rolled back {} in-flight requirements", reverted.len())
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("rollback failed: {e}"),
                }
            }
            Task::Shutdown => {}
        }
    }
}
