use std::{
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::{
    api::{CompletionCallback, MapContext, MapperFactory},
    buffer::BoundedBuffer,
    config::{JobConfig, SpillCleanup},
    record::{Payload, SortKey},
    spill::SpillStore,
    task::{map_task_id, InputSplit, TaskKind, TaskRecord},
    tsv,
};

/// Ruta del archivo intermedio que produce una tarea map.
pub fn map_output_path(scratch_dir: &Path, task_id: &str) -> PathBuf {
    scratch_dir.join(format!("map-output-{task_id}.txt"))
}

/// Tarea map: aplica el mapper a un split y deja un único archivo
/// intermedio ordenado por clave.
pub struct MapTask<K, V> {
    record: TaskRecord,
    split: InputSplit,
    config: Arc<JobConfig>,
    scratch_dir: PathBuf,
    mapper_factory: MapperFactory<K, V>,
    on_complete: Option<CompletionCallback>,
}

impl<K: SortKey, V: Payload> MapTask<K, V> {
    pub fn new(
        split: InputSplit,
        config: Arc<JobConfig>,
        scratch_dir: impl Into<PathBuf>,
        mapper_factory: MapperFactory<K, V>,
    ) -> Self {
        let scratch_dir = scratch_dir.into();
        let id = map_task_id(split.index);
        let output = map_output_path(&scratch_dir, &id);

        Self {
            record: TaskRecord::new(id, TaskKind::Map, output),
            split,
            config,
            scratch_dir,
            mapper_factory,
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

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn into_record(self) -> TaskRecord {
        self.record
    }

    /// Ejecuta la tarea. Devuelve `true` si terminó en `Completed`.
    /// Cualquier error (o panic del mapper) deja la tarea en `Failed`.
    pub fn execute(&mut self) -> bool {
        if !self.record.start() {
            warn!("{} ya fue ejecutada (estado {:?})", self.record.id, self.record.state);
            return false;
        }

        info!(
            "iniciando {} ({} líneas, {} bytes)",
            self.record.id,
            self.split.lines.len(),
            self.split.size_bytes
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run()))
            .unwrap_or_else(|p| Err(anyhow::anyhow!("panic en el mapper: {}", panic_message(&*p))));

        match outcome {
            Ok(()) => {
                self.record.complete();
                info!(
                    "{} completada: {} líneas, {} parejas, {} spills -> {}",
                    self.record.id,
                    self.record.records_in,
                    self.record.records_out,
                    self.record.spills,
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

        let store = SpillStore::new(self.scratch_dir.join("spill"), id.as_str());
        let buffer = BoundedBuffer::new(
            self.config.buffer_capacity_bytes,
            self.config.spill_threshold,
            store,
        );

        let mut mapper = (self.mapper_factory)();
        let mut ctx = MapContext::new(&id, &self.config, &buffer);

        mapper.setup(&mut ctx).context("setup del mapper")?;

        let mut position: u64 = 0;
        for line in &self.split.lines {
            if line.trim().is_empty() {
                continue;
            }
            mapper
                .map(position, line, &mut ctx)
                .with_context(|| format!("map falló en la línea {position}"))?;
            position += 1;
        }

        mapper.cleanup(&mut ctx).context("cleanup del mapper")?;
        let emitted = ctx.emitted();

        let written = if buffer.has_runs() {
            // hubo spills: lo que quedó en memoria pasa a ser el último run
            buffer
                .force_flush()
                .context("spill final del buffer")?;
            let n = buffer
                .merge_runs(&output)
                .with_context(|| format!("merge de runs a {}", output.display()))?;
            if self.config.spill_cleanup == SpillCleanup::DeleteOnSuccess {
                buffer.remove_runs();
            }
            n
        } else {
            let mut entries = buffer.drain_all();
            entries.sort_by(|a, b| a.key().cmp(b.key()));
            debug!("{} sin spills: {} entradas en memoria", id, entries.len());
            tsv::write_pairs(&output, entries.iter().map(|e| (e.key(), e.value())))
                .with_context(|| format!("escritura de {}", output.display()))?
        };

        if written != emitted {
            warn!("{}: {} emitidas pero {} escritas", id, emitted, written);
        }

        self.record.records_in = position;
        self.record.records_out = written;
        self.record.spills = buffer.spill_count();
        Ok(())
    }
}

/// Extrae el mensaje de un panic capturado.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic sin mensaje".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Mapper;
    use crate::task::TaskState;
    use std::{
        env, fs,
        sync::{Arc, Mutex},
    };

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("map_task_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn config(dir: &Path, capacity: usize, cleanup: SpillCleanup) -> Arc<JobConfig> {
        Arc::new(
            JobConfig::builder()
                .input_dir(dir)
                .output_dir(dir.join("out"))
                .buffer_capacity_bytes(capacity)
                .spill_threshold(1.0)
                .spill_cleanup(cleanup)
                .build()
                .unwrap(),
        )
    }

    struct Words;

    impl Mapper<String, i64> for Words {
        fn map(&mut self, _pos: u64, line: &str, ctx: &mut MapContext<'_, String, i64>) -> Result<()> {
            for w in line.split_whitespace() {
                ctx.emit(w.to_string(), 1)?;
            }
            Ok(())
        }
    }

    fn words() -> MapperFactory<String, i64> {
        Arc::new(|| Box::new(Words) as Box<dyn Mapper<String, i64>>)
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Con o sin spills el archivo intermedio tiene exactamente lo mismo.
    #[test]
    fn salida_igual_con_y_sin_spill() {
        let tmp = temp_dir("transparency");
        let split = InputSplit::new(0, vec!["a b a".into(), "b a".into()]);

        let mut sin_spill = MapTask::new(
            split.clone(),
            config(&tmp, 1 << 20, SpillCleanup::Retain),
            tmp.join("big"),
            words(),
        );
        assert!(sin_spill.execute());
        assert_eq!(sin_spill.record().spills, 0);

        let mut con_spill = MapTask::new(
            split,
            config(&tmp, 1, SpillCleanup::Retain),
            tmp.join("tiny"),
            words(),
        );
        assert!(con_spill.execute());
        // capacidad 1 => un spill por cada emit
        assert_eq!(con_spill.record().spills, 5);

        let a = lines(&sin_spill.record().output_path);
        let b = lines(&con_spill.record().output_path);
        assert_eq!(a, vec!["a\t1", "a\t1", "a\t1", "b\t1", "b\t1"]);
        assert_eq!(a, b);
    }

    struct Positions;

    impl Mapper<i64, String> for Positions {
        fn map(&mut self, pos: u64, line: &str, ctx: &mut MapContext<'_, i64, String>) -> Result<()> {
            ctx.emit(pos as i64, line.trim().to_string())
        }
    }

    #[test]
    fn lineas_vacias_no_cuentan_posicion() {
        let tmp = temp_dir("positions");
        let split = InputSplit::new(
            2,
            vec!["uno".into(), "".into(), "   ".into(), "dos".into()],
        );
        let factory: MapperFactory<i64, String> =
            Arc::new(|| Box::new(Positions) as Box<dyn Mapper<i64, String>>);

        let mut task = MapTask::new(split, config(&tmp, 1 << 20, SpillCleanup::Retain), &tmp, factory);
        assert_eq!(task.id(), "map-task-2");
        assert!(task.execute());

        let rec = task.record();
        assert_eq!(rec.records_in, 2);
        assert_eq!(rec.output_path, tmp.join("map-output-map-task-2.txt"));
        assert_eq!(lines(&rec.output_path), vec!["0\tuno", "1\tdos"]);
    }

    struct FailsOn(&'static str);

    impl Mapper<String, i64> for FailsOn {
        fn map(&mut self, _pos: u64, line: &str, ctx: &mut MapContext<'_, String, i64>) -> Result<()> {
            if line.contains(self.0) {
                anyhow::bail!("línea prohibida: {line}");
            }
            ctx.emit(line.to_string(), 1)
        }
    }

    #[test]
    fn error_del_mapper_deja_la_tarea_en_failed() {
        let tmp = temp_dir("failure");
        let split = InputSplit::new(0, vec!["ok".into(), "boom".into()]);
        let factory: MapperFactory<String, i64> =
            Arc::new(|| Box::new(FailsOn("boom")) as Box<dyn Mapper<String, i64>>);

        let llamadas = Arc::new(Mutex::new(Vec::<String>::new()));
        let ll = Arc::clone(&llamadas);

        let mut task = MapTask::new(split, config(&tmp, 1 << 20, SpillCleanup::Retain), &tmp, factory)
            .on_complete(Arc::new(move |id: &str, _: &Path| ll.lock().unwrap().push(id.to_string())));

        assert!(!task.execute());
        let rec = task.record();
        assert_eq!(rec.state, TaskState::Failed);
        assert!(rec.error.as_deref().unwrap().contains("línea prohibida"));
        assert!(llamadas.lock().unwrap().is_empty());

        // una tarea terminada no se vuelve a ejecutar
        assert!(!task.execute());
        assert_eq!(task.record().state, TaskState::Failed);
    }

    struct Panics;

    impl Mapper<String, i64> for Panics {
        fn map(&mut self, _pos: u64, _line: &str, _ctx: &mut MapContext<'_, String, i64>) -> Result<()> {
            panic!("mapper roto");
        }
    }

    #[test]
    fn panic_del_mapper_es_un_fallo() {
        let tmp = temp_dir("panic");
        let split = InputSplit::new(0, vec!["x".into()]);
        let factory: MapperFactory<String, i64> =
            Arc::new(|| Box::new(Panics) as Box<dyn Mapper<String, i64>>);

        let mut task = MapTask::new(split, config(&tmp, 1 << 20, SpillCleanup::Retain), &tmp, factory);
        assert!(!task.execute());
        assert!(task.record().error.as_deref().unwrap().contains("mapper roto"));
    }

    #[test]
    fn callback_recibe_id_y_ruta() {
        let tmp = temp_dir("callback");
        let split = InputSplit::new(1, vec!["hola".into()]);

        let llamadas = Arc::new(Mutex::new(Vec::<(String, PathBuf)>::new()));
        let ll = Arc::clone(&llamadas);

        let mut task = MapTask::new(split, config(&tmp, 1 << 20, SpillCleanup::Retain), &tmp, words())
            .on_complete(Arc::new(move |id: &str, path: &Path| {
                ll.lock().unwrap().push((id.to_string(), path.to_path_buf()))
            }));
        assert!(task.execute());

        let got = llamadas.lock().unwrap().clone();
        assert_eq!(
            got,
            vec![("map-task-1".to_string(), tmp.join("map-output-map-task-1.txt"))]
        );
    }

    #[test]
    fn delete_on_success_borra_los_runs() {
        let tmp = temp_dir("cleanup");
        let split = InputSplit::new(0, vec!["a b c".into()]);

        let mut task = MapTask::new(split, config(&tmp, 1, SpillCleanup::DeleteOnSuccess), &tmp, words());
        assert!(task.execute());
        assert_eq!(task.record().spills, 3);

        let quedan = fs::read_dir(tmp.join("spill")).unwrap().count();
        assert_eq!(quedan, 0);
        assert_eq!(lines(&task.record().output_path), vec!["a\t1", "b\t1", "c\t1"]);
    }

    /// Una clave con tab no puede escribirse sin romper el formato: la
    /// tarea falla en vez de dejar un intermedio corrupto.
    #[test]
    fn clave_con_tab_hace_fallar_la_tarea() {
        struct Tabs;

        impl Mapper<String, i64> for Tabs {
            fn map(&mut self, _pos: u64, _line: &str, ctx: &mut MapContext<'_, String, i64>) -> Result<()> {
                ctx.emit("a\tb".to_string(), 1)
            }
        }

        let tmp = temp_dir("tab_key");
        let split = InputSplit::new(0, vec!["x".into(), "y".into()]);

        for (sub, capacity) in [("big", 1usize << 20), ("tiny", 1usize)] {
            let factory: MapperFactory<String, i64> = Arc::new(|| Box::new(Tabs) as Box<dyn Mapper<String, i64>>);
            let mut task = MapTask::new(
                split.clone(),
                config(&tmp, capacity, SpillCleanup::Retain),
                tmp.join(sub),
                factory,
            );

            assert!(!task.execute(), "capacidad {capacity}");
            assert_eq!(task.record().state, TaskState::Failed);
            assert!(task.record().error.as_deref().unwrap().contains("tab"));
        }
    }
}
