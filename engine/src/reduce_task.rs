use std::{
    collections::BTreeMap,
    io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::{
    api::{CompletionCallback, ReduceContext, ReducerFactory},
    config::JobConfig,
    map_task::panic_message,
    record::Datum,
    task::{reduce_task_id, TaskKind, TaskRecord},
    tsv::{self, TsvWriter},
};

/// `part-r-00000.txt`, `part-r-00001.txt`, ...
pub fn reduce_output_path(output_dir: &Path, index: usize) -> PathBuf {
    output_dir.join(format!("part-r-{index:05}.txt"))
}

/// Valores agrupados por clave: claves únicas y ordenadas, valores en el
/// orden en que se leyeron.
pub type Grouped = BTreeMap<String, Vec<Datum>>;

/// Lee los archivos intermedios en orden y agrupa por clave.
/// Devuelve también cuántas parejas se leyeron. Los archivos que no
/// existen se saltan con un warning.
pub fn group_files(paths: &[PathBuf]) -> io::Result<(Grouped, u64)> {
    let mut grouped = Grouped::new();
    let mut total = 0u64;

    for path in paths {
        if !path.exists() {
            warn!("archivo intermedio inexistente, se salta: {}", path.display());
            continue;
        }

        let summary = tsv::for_each_pair(path, |key, value| {
            let datum = Datum::parse(value);
            match grouped.get_mut(key) {
                Some(values) => values.push(datum),
                None => {
                    grouped.insert(key.to_string(), vec![datum]);
                }
            }
        })?;

        debug!(
            "leído {}: {} parejas, {} líneas descartadas",
            path.display(),
            summary.pairs,
            summary.skipped
        );
        total += summary.pairs;
    }

    Ok((grouped, total))
}

/// Tarea reduce: agrupa sus archivos intermedios y llama al reducer una
/// vez por clave, escribiendo a su propio `part-r-*`.
pub struct ReduceTask {
    record: TaskRecord,
    inputs: Vec<PathBuf>,
    config: Arc<JobConfig>,
    reducer_factory: ReducerFactory,
    on_complete: Option<CompletionCallback>,
}

impl ReduceTask {
    pub fn new(
        index: usize,
        inputs: Vec<PathBuf>,
        config: Arc<JobConfig>,
        reducer_factory: ReducerFactory,
    ) -> Self {
        let output = reduce_output_path(&config.output_dir, index);
        Self {
            record: TaskRecord::new(reduce_task_id(index), TaskKind::Reduce, output),
            inputs,
            config,
            reducer_factory,
            on_complete: None,
        }
    }

    pub fn on_complete(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn into_record(self) -> TaskRecord {
        self.record
    }

    pub fn execute(&mut self) -> bool {
        if !self.record.start() {
            warn!("{} ya fue ejecutada (estado {:?})", self.record.id, self.record.state);
            return false;
        }

        info!(
            "iniciando {} con {} archivos intermedios",
            self.record.id,
            self.inputs.len()
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run()))
            .unwrap_or_else(|p| Err(anyhow::anyhow!("panic en el reducer: {}", panic_message(&*p))));

        match outcome {
            Ok(()) => {
                self.record.complete();
                info!(
                    "{} completada: {} parejas leídas, {} escritas -> {}",
                    self.record.id,
                    self.record.records_in,
                    self.record.records_out,
                    self.record.output_path.display()
                );
                if let Some(cb) = &self.on_complete {
                    cb(&self.record.id, &self.record.output_path);
                }
                true
            }
            Err(e) => {
                error!("{} falló: {:#}", self.record.id, e);
                self.record.fail(format!("{e:#}"));
                false
            }
        }
    }

    fn run(&mut self) -> Result<()> {
        let id = self.record.id.clone();
        let output = self.record.output_path.clone();

        let mut reducer = (self.reducer_factory)();
        let mut writer = TsvWriter::create(&output)
            .with_context(|| format!("no se pudo crear {}", output.display()))?;

        let records_in = {
            let mut ctx = ReduceContext::new(&id, &self.config, &mut writer);
            reducer.setup(&mut ctx).context("setup del reducer")?;

            let (grouped, records_in) =
                group_files(&self.inputs).context("lectura de archivos intermedios")?;
            debug!("{}: {} claves distintas", id, grouped.len());

            for (key, values) in &grouped {
                reducer
                    .reduce(key, values, &mut ctx)
                    .with_context(|| format!("reduce falló en la clave {key:?}"))?;
            }

            reducer.cleanup(&mut ctx).context("cleanup del reducer")?;
            records_in
        };

        let written = writer
            .finish()
            .with_context(|| format!("flush de {}", output.display()))?;

        self.record.records_in = records_in;
        self.record.records_out = written;
        Ok(())
    }
}
