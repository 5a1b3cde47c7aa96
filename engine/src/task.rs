use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Map,
    Reduce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

pub fn map_task_id(index: usize) -> TaskId {
    format!("map-task-{index}")
}

pub fn reduce_task_id(index: usize) -> TaskId {
    format!("reduce-task-{index}")
}

/// Estado observable de una tarea: lo que queda después de ejecutarla.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_path: PathBuf,
    /// Mensaje del error si la tarea terminó en `Failed`.
    pub error: Option<String>,
    /// Líneas (map) o parejas (reduce) leídas.
    pub records_in: u64,
    /// Parejas escritas en el archivo de salida.
    pub records_out: u64,
    pub spills: usize,
}

impl TaskRecord {
    pub fn new(id: TaskId, kind: TaskKind, output_path: PathBuf) -> Self {
        Self {
            id,
            kind,
            state: TaskState::Pending,
            started_at: None,
            finished_at: None,
            output_path,
            error: None,
            records_in: 0,
            records_out: 0,
            spills: 0,
        }
    }

    /// Pending -> Running. Devuelve false si la tarea ya había arrancado.
    pub fn start(&mut self) -> bool {
        if self.state != TaskState::Pending {
            return false;
        }
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
        true
    }

    pub fn complete(&mut self) {
        self.finish(TaskState::Completed, None);
    }

    pub fn fail(&mut self, error: String) {
        self.finish(TaskState::Failed, Some(error));
    }

    fn finish(&mut self, state: TaskState, error: Option<String>) {
        // los estados terminales son definitivos
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Completed
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => Some((f - s).num_milliseconds()),
            _ => None,
        }
    }
}

/// Porción contigua de líneas de entrada para una tarea map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSplit {
    pub index: usize,
    pub lines: Vec<String>,
    /// Tamaño estimado en bytes (largo de cada línea + salto).
    pub size_bytes: usize,
}

impl InputSplit {
    pub fn new(index: usize, lines: Vec<String>) -> Self {
        let size_bytes = lines.iter().map(|l| l.len() + 1).sum();
        Self {
            index,
            lines,
            size_bytes,
        }
    }
}
