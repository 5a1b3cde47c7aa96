//! Interfaz entre el engine y el código de usuario.
//!
//! Un job se define con un [`Mapper`] (línea -> parejas clave/valor) y un
//! [`Reducer`] (clave + valores agrupados -> parejas de salida). Cada tarea
//! construye su propia instancia a partir de una factory, así que las
//! implementaciones pueden tener estado sin sincronizar nada.

use std::{fmt::Display, path::Path, sync::Arc};

use anyhow::{Context, Result};

use crate::{
    buffer::BoundedBuffer,
    config::JobConfig,
    record::{Datum, Payload, SortKey},
    tsv::TsvWriter,
};

/// Contexto que ve un mapper durante la ejecución de su tarea.
pub struct MapContext<'a, K, V> {
    task_id: &'a str,
    config: &'a JobConfig,
    buffer: &'a BoundedBuffer<K, V>,
    emitted: u64,
}

impl<'a, K: SortKey, V: Payload> MapContext<'a, K, V> {
    pub(crate) fn new(
        task_id: &'a str,
        config: &'a JobConfig,
        buffer: &'a BoundedBuffer<K, V>,
    ) -> Self {
        Self {
            task_id,
            config,
            buffer,
            emitted: 0,
        }
    }

    /// Agrega una pareja al buffer de la tarea (puede disparar un spill).
    pub fn emit(&mut self, key: K, value: V) -> Result<()> {
        self.buffer
            .insert(key, value)
            .with_context(|| format!("spill fallido en {}", self.task_id))?;
        self.emitted += 1;
        Ok(())
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl<'a, K, V> MapContext<'a, K, V> {
    pub fn task_id(&self) -> &str {
        self.task_id
    }

    pub fn config(&self) -> &JobConfig {
        self.config
    }
}

/// Transformación de la fase map.
pub trait Mapper<K, V>: Send {
    fn setup(&mut self, _ctx: &mut MapContext<'_, K, V>) -> Result<()> {
        Ok(())
    }

    /// `position` cuenta las líneas no vacías ya procesadas por la tarea.
    fn map(&mut self, position: u64, line: &str, ctx: &mut MapContext<'_, K, V>) -> Result<()>;

    fn cleanup(&mut self, _ctx: &mut MapContext<'_, K, V>) -> Result<()> {
        Ok(())
    }
}

/// Contexto que ve un reducer: escribe directo al archivo de salida.
pub struct ReduceContext<'a> {
    task_id: &'a str,
    config: &'a JobConfig,
    writer: &'a mut TsvWriter,
}

impl<'a> ReduceContext<'a> {
    pub(crate) fn new(task_id: &'a str, config: &'a JobConfig, writer: &'a mut TsvWriter) -> Self {
        Self {
            task_id,
            config,
            writer,
        }
    }

    pub fn emit<K, V>(&mut self, key: &K, value: &V) -> Result<()>
    where
        K: Display + ?Sized,
        V: Display + ?Sized,
    {
        self.writer.write_pair(key, value).with_context(|| {
            format!(
                "error escribiendo salida de {} en {}",
                self.task_id,
                self.writer.path().display()
            )
        })
    }

    pub fn task_id(&self) -> &str {
        self.task_id
    }

    pub fn config(&self) -> &JobConfig {
        self.config
    }

    pub fn written(&self) -> u64 {
        self.writer.written()
    }
}

/// Agregación de la fase reduce. Se llama una vez por clave, en orden
/// ascendente, con los valores en el orden en que se leyeron.
pub trait Reducer: Send {
    fn setup(&mut self, _ctx: &mut ReduceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn reduce(&mut self, key: &str, values: &[Datum], ctx: &mut ReduceContext<'_>) -> Result<()>;

    fn cleanup(&mut self, _ctx: &mut ReduceContext<'_>) -> Result<()> {
        Ok(())
    }
}

pub type MapperFactory<K, V> = Arc<dyn Fn() -> Box<dyn Mapper<K, V>> + Send + Sync>;
pub type ReducerFactory = Arc<dyn Fn() -> Box<dyn Reducer> + Send + Sync>;

/// Se invoca con `(task_id, output_path)` cuando una tarea termina bien.
pub type CompletionCallback = Arc<dyn Fn(&str, &Path) + Send + Sync>;
