//! Pool de workers con dos clases de tareas (map y reduce).
//!
//! Cada clase tiene su propio semáforo con tantos permisos como hilos le
//! tocan; el trabajo corre en `spawn_blocking` porque las tareas son
//! síncronas (I/O de archivos, spills). El presupuesto total de hilos se
//! reparte 2:1 a favor de map.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{Notify, Semaphore},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, info, warn};

use crate::{
    error::{JobError, Result},
    task::TaskKind,
};

/// Reparte `total` hilos: `map = max(1, total*2/3)`, `reduce = max(1, total - map)`.
pub fn split_threads(total: usize) -> (usize, usize) {
    let map = (total * 2 / 3).max(1);
    let reduce = total.saturating_sub(map).max(1);
    (map, reduce)
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    completed: AtomicUsize,
    submitted: AtomicUsize,
    panicked: AtomicUsize,
}

impl Counters {
    fn pending(&self) -> usize {
        self.submitted
            .load(Ordering::SeqCst)
            .saturating_sub(self.completed.load(Ordering::SeqCst))
    }
}

/// Se suelta cuando la tarea termina, falla o es abortada: así el
/// contador `completed` siempre alcanza a `submitted`.
struct FinishGuard {
    counters: Arc<Counters>,
    idle: Arc<Notify>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

struct ActiveGuard(Arc<Counters>);

impl ActiveGuard {
    fn enter(counters: &Arc<Counters>) -> Self {
        counters.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counters))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Lane {
    kind: TaskKind,
    threads: usize,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl Lane {
    fn new(kind: TaskKind, threads: usize) -> Self {
        Self {
            kind,
            threads,
            permits: Arc::new(Semaphore::new(threads)),
            counters: Arc::new(Counters::default()),
            idle: Arc::new(Notify::new()),
            aborts: Mutex::new(Vec::new()),
        }
    }

    fn status(&self) -> LaneStatus {
        LaneStatus {
            threads: self.threads,
            active: self.counters.active.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            panicked: self.counters.panicked.load(Ordering::SeqCst),
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // registrarse antes de mirar el contador para no perder el aviso
            notified.as_mut().enable();
            if self.counters.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn cancel_all(&self) {
        self.permits.close();
        let handles = std::mem::take(&mut *self.aborts.lock().unwrap_or_else(|e| e.into_inner()));
        for h in handles {
            h.abort();
        }
    }
}

/// Snapshot de una clase del pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneStatus {
    pub threads: usize,
    pub active: usize,
    pub completed: usize,
    pub submitted: usize,
    pub panicked: usize,
}

/// Snapshot serializable de todo el pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub map: LaneStatus,
    pub reduce: LaneStatus,
    pub accepting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownOutcome {
    /// Todo el trabajo en vuelo terminó dentro del timeout.
    Graceful,
    /// Se venció el timeout y se canceló lo pendiente.
    Forced,
}

/// Handle de una tarea enviada al pool.
pub struct TaskHandle<T> {
    label: String,
    inner: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Espera el resultado. Un panic o una cancelación se devuelven como error.
    pub async fn join(self) -> Result<T> {
        match self.inner.await {
            Ok(res) => res,
            Err(e) if e.is_cancelled() => Err(JobError::TaskCancelled(self.label)),
            Err(_) => Err(JobError::TaskPanicked(self.label)),
        }
    }
}

pub struct WorkerPool {
    map: Lane,
    reduce: Lane,
    accepting: AtomicBool,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Pool con `total_threads` repartidos entre map y reduce.
    pub fn new(total_threads: usize, shutdown_timeout: Duration) -> Self {
        let (map, reduce) = split_threads(total_threads);
        Self::with_threads(map, reduce, shutdown_timeout)
    }

    pub fn with_threads(map_threads: usize, reduce_threads: usize, shutdown_timeout: Duration) -> Self {
        let map_threads = map_threads.max(1);
        let reduce_threads = reduce_threads.max(1);
        info!(
            "pool de workers: {} hilos map, {} hilos reduce",
            map_threads, reduce_threads
        );
        Self {
            map: Lane::new(TaskKind::Map, map_threads),
            reduce: Lane::new(TaskKind::Reduce, reduce_threads),
            accepting: AtomicBool::new(true),
            shutdown_timeout,
        }
    }

    fn lane(&self, kind: TaskKind) -> &Lane {
        match kind {
            TaskKind::Map => &self.map,
            TaskKind::Reduce => &self.reduce,
        }
    }

    /// Encola un trabajo síncrono en la clase indicada.
    /// Debe llamarse desde dentro de un runtime de tokio.
    pub fn submit<F, T>(&self, kind: TaskKind, label: impl Into<String>, job: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(JobError::PoolClosed);
        }

        let lane = self.lane(kind);
        let label = label.into();
        lane.counters.submitted.fetch_add(1, Ordering::SeqCst);

        let finish = FinishGuard {
            counters: Arc::clone(&lane.counters),
            idle: Arc::clone(&lane.idle),
        };
        let permits = Arc::clone(&lane.permits);
        let counters = Arc::clone(&lane.counters);
        let task_label = label.clone();

        let inner = tokio::spawn(async move {
            let _finish = finish;

            let Ok(_permit) = permits.acquire_owned().await else {
                return Err(JobError::TaskCancelled(task_label));
            };

            let _active = ActiveGuard::enter(&counters);
            match tokio::task::spawn_blocking(job).await {
                Ok(value) => Ok(value),
                Err(e) if e.is_panic() => {
                    counters.panicked.fetch_add(1, Ordering::SeqCst);
                    warn!("panic en la tarea {}", task_label);
                    Err(JobError::TaskPanicked(task_label))
                }
                Err(_) => Err(JobError::TaskCancelled(task_label)),
            }
        });

        {
            let mut aborts = lane.aborts.lock().unwrap_or_else(|e| e.into_inner());
            aborts.retain(|h| !h.is_finished());
            aborts.push(inner.abort_handle());
        }

        debug!("tarea {} encolada en el pool {:?}", label, lane.kind);
        Ok(TaskHandle { label, inner })
    }

    /// Espera a que terminen todas las tareas enviadas a una clase.
    pub async fn await_all(&self, kind: TaskKind) {
        self.lane(kind).drained().await;
    }

    /// Deja de aceptar trabajo y espera lo que está en vuelo hasta el
    /// timeout configurado; si se vence, cancela lo pendiente.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        self.accepting.store(false, Ordering::SeqCst);

        let drain = async {
            self.map.drained().await;
            self.reduce.drained().await;
        };

        match tokio::time::timeout(self.shutdown_timeout, drain).await {
            Ok(()) => {
                info!("pool de workers cerrado");
                ShutdownOutcome::Graceful
            }
            Err(_) => {
                warn!(
                    "el pool no terminó en {:?}; cancelando tareas pendientes",
                    self.shutdown_timeout
                );
                self.map.cancel_all();
                self.reduce.cancel_all();
                ShutdownOutcome::Forced
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    pub fn threads(&self, kind: TaskKind) -> usize {
        self.lane(kind).threads
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            map: self.map.status(),
            reduce: self.reduce.status(),
            accepting: !self.is_shutdown(),
        }
    }
}
