use std::{fmt, io};

use thiserror::Error;

/// Fase del job en la que ocurrió un fallo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Map,
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => f.write_str("map"),
            Phase::Reduce => f.write_str("reduce"),
        }
    }
}

/// Errores a nivel de job (scheduler, pool, configuración).
///
/// Los errores dentro de una tarea son `anyhow::Error` y nunca salen de la
/// tarea: se convierten en estado `Failed` + mensaje en su registro.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuración inválida: {0}")]
    InvalidConfig(String),

    #[error("fase {phase} fallida: tareas con error {failed:?}")]
    PhaseFailed { phase: Phase, failed: Vec<String> },

    #[error("el pool de workers ya no acepta tareas")]
    PoolClosed,

    #[error("la tarea {0} hizo panic")]
    TaskPanicked(String),

    #[error("la tarea {0} fue cancelada")]
    TaskCancelled(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;
