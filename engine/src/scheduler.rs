use std::{
    borrow::Cow,
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Instant,
};

use chrono::{DateTime, Utc};
use glob::{glob, Pattern};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    api::{MapperFactory, ReducerFactory},
    config::{JobConfig, SpillCleanup},
    error::{JobError, Phase, Result},
    map_task::MapTask,
    pool::{PoolStatus, ShutdownOutcome, TaskHandle, WorkerPool},
    record::{Payload, SortKey},
    reduce_task::ReduceTask,
    task::{InputSplit, TaskKind, TaskRecord},
};

/* =========================
   Estadísticas del job
   ========================= */

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub wall_ms: u128,
    pub records_in: u64,
    pub records_out: u64,
    pub spills: usize,
}

impl PhaseStats {
    fn from_records(records: &[TaskRecord], wall_ms: u128) -> Self {
        let succeeded = records.iter().filter(|r| r.succeeded()).count();
        Self {
            total: records.len(),
            succeeded,
            failed: records.len() - succeeded,
            wall_ms,
            records_in: records.iter().map(|r| r.records_in).sum(),
            records_out: records.iter().map(|r| r.records_out).sum(),
            spills: records.iter().map(|r| r.spills).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatistics {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u128,
    pub input_files: usize,
    pub input_lines: usize,
    pub map: PhaseStats,
    pub reduce: PhaseStats,
    pub pool: PoolStatus,
    pub shutdown: ShutdownOutcome,
    pub outputs: Vec<PathBuf>,
}

/* =========================
   Entrada y particionado
   ========================= */

/// Lista los `*.txt` de un directorio, ordenados por ruta.
pub fn list_input_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*.txt", Pattern::escape(&dir.to_string_lossy()));
    let entries = glob(&pattern)
        .map_err(|e| JobError::InvalidConfig(format!("patrón de entrada inválido {pattern}: {e}")))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(io::Error::from)?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Lee todas las líneas no vacías de los archivos, en orden.
///
/// Los bytes que no son UTF-8 válido se reemplazan por `U+FFFD` en vez de
/// abortar el job. Los errores de E/S llevan la ruta del archivo.
pub fn read_lines(files: &[PathBuf]) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut buf = Vec::new();

    for path in files {
        let with_path = |e: io::Error| io::Error::new(e.kind(), format!("{}: {}", path.display(), e));
        let mut reader = BufReader::new(File::open(path).map_err(with_path)?);
        let mut lossy = 0usize;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).map_err(with_path)? == 0 {
                break;
            }
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }

            let line = match String::from_utf8_lossy(&buf) {
                Cow::Borrowed(s) => s.to_string(),
                Cow::Owned(s) => {
                    lossy += 1;
                    s
                }
            };
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }

        if lossy > 0 {
            warn!(
                "{}: {} líneas con bytes no UTF-8 (reemplazados)",
                path.display(),
                lossy
            );
        }
    }
    Ok(lines)
}

/// Parte las líneas en hasta `map_tasks` splits contiguos de
/// `max(1, L / M)` líneas; el último absorbe el resto. Los splits que
/// empezarían más allá del final no se crean.
pub fn split_lines(lines: Vec<String>, map_tasks: usize) -> Vec<InputSplit> {
    if map_tasks == 0 {
        return Vec::new();
    }

    let total = lines.len();
    let per = (total / map_tasks).max(1);
    let mut iter = lines.into_iter();
    let mut splits = Vec::new();

    for i in 0..map_tasks {
        let start = i * per;
        if start >= total {
            break;
        }
        let end = if i == map_tasks - 1 {
            total
        } else {
            (start + per).min(total)
        };
        let chunk: Vec<String> = iter.by_ref().take(end - start).collect();
        splits.push(InputSplit::new(i, chunk));
    }

    splits
}

/// Reparte archivos en `buckets` grupos: el archivo i va al grupo i % buckets.
pub fn assign_round_robin(files: Vec<PathBuf>, buckets: usize) -> Vec<Vec<PathBuf>> {
    let mut out: Vec<Vec<PathBuf>> = vec![Vec::new(); buckets.max(1)];
    let n = out.len();
    for (i, f) in files.into_iter().enumerate() {
        out[i % n].push(f);
    }
    out
}

/* =========================
   Scheduler
   ========================= */

/// Orquesta un job completo: split, fase map, barrera, fase reduce.
pub struct Scheduler<K, V> {
    config: Arc<JobConfig>,
    job_id: String,
    mapper: Option<MapperFactory<K, V>>,
    reducer: Option<ReducerFactory>,
    pool: WorkerPool,
    records: Mutex<Vec<TaskRecord>>,
}

impl<K: SortKey, V: Payload> Scheduler<K, V> {
    pub fn new(config: JobConfig) -> Self {
        let pool = WorkerPool::new(config.max_threads, config.shutdown_timeout);
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            config: Arc::new(config),
            mapper: None,
            reducer: None,
            pool,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn mapper(mut self, factory: MapperFactory<K, V>) -> Self {
        self.mapper = Some(factory);
        self
    }

    pub fn reducer(mut self, factory: ReducerFactory) -> Self {
        self.reducer = Some(factory);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Directorio de trabajo del job: `<temp_dir>/<job_id>`.
    pub fn scratch_dir(&self) -> PathBuf {
        self.config.temp_dir.join(&self.job_id)
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Registros de todas las tareas ejecutadas (incluidas las fallidas).
    pub fn task_records(&self) -> Vec<TaskRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn validate(&self) -> Result<(&MapperFactory<K, V>, &ReducerFactory)> {
        let mapper = self
            .mapper
            .as_ref()
            .ok_or_else(|| JobError::InvalidConfig("falta la función map".to_string()))?;
        let reducer = self
            .reducer
            .as_ref()
            .ok_or_else(|| JobError::InvalidConfig("falta la función reduce".to_string()))?;
        self.config.validate()?;
        Ok((mapper, reducer))
    }

    /// Ejecuta el job. Sólo puede llamarse una vez: al terminar el pool
    /// queda cerrado.
    pub async fn run(&self) -> Result<JobStatistics> {
        let (mapper, reducer) = self.validate()?;

        let started_at = Utc::now();
        let t0 = Instant::now();
        info!(
            "job {} iniciado: entrada={} salida={} map_tasks={} reduce_tasks={}",
            self.job_id,
            self.config.input_dir.display(),
            self.config.output_dir.display(),
            self.config.map_tasks,
            self.config.reduce_tasks
        );

        let result = self.run_phases(mapper, reducer).await;
        let shutdown = self.pool.shutdown().await;

        match result {
            Ok(run) => {
                self.apply_cleanup();

                let stats = JobStatistics {
                    job_id: self.job_id.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    duration_ms: t0.elapsed().as_millis(),
                    input_files: run.input_files,
                    input_lines: run.input_lines,
                    map: run.map,
                    reduce: run.reduce,
                    pool: self.pool.status(),
                    shutdown,
                    outputs: run.outputs,
                };
                info!(
                    job_id = %stats.job_id,
                    duration_ms = stats.duration_ms as u64,
                    map_tasks = stats.map.total,
                    reduce_tasks = stats.reduce.total,
                    "job completado"
                );
                Ok(stats)
            }
            Err(e) => {
                error!("job {} fallido: {}", self.job_id, e);
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        mapper: &MapperFactory<K, V>,
        reducer: &ReducerFactory,
    ) -> Result<PhasesOutcome> {
        let scratch = self.scratch_dir();
        fs::create_dir_all(&scratch)?;
        fs::create_dir_all(&self.config.output_dir)?;

        let files = list_input_files(&self.config.input_dir)?;
        if files.is_empty() {
            warn!(
                "no hay archivos .txt en {}",
                self.config.input_dir.display()
            );
        }
        let lines = read_lines(&files)?;
        let input_lines = lines.len();
        let splits = split_lines(lines, self.config.map_tasks);
        info!(
            "{} archivos, {} líneas -> {} splits",
            files.len(),
            input_lines,
            splits.len()
        );

        /* ---------- fase map ---------- */

        let t_map = Instant::now();
        let map_outputs: Arc<Mutex<BTreeMap<usize, PathBuf>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let mut handles = Vec::with_capacity(splits.len());

        for split in splits {
            let index = split.index;
            let outputs = Arc::clone(&map_outputs);
            let mut task = MapTask::new(split, Arc::clone(&self.config), &scratch, Arc::clone(mapper))
                .on_complete(Arc::new(move |id: &str, path: &Path| {
                    debug!("{} dejó su intermedio en {}", id, path.display());
                    outputs
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(index, path.to_path_buf());
                }));

            let id = task.id().to_string();
            let handle = self.pool.submit(TaskKind::Map, id.clone(), move || {
                task.execute();
                task.into_record()
            })?;
            handles.push((id, handle));
        }

        let map_records = self.join_phase(TaskKind::Map, handles).await;
        let map = PhaseStats::from_records(&map_records, t_map.elapsed().as_millis());
        info!(
            phase = "map",
            tasks = map.total,
            failed = map.failed,
            wall_ms = map.wall_ms as u64,
            "fase map terminada"
        );
        fail_if_any(Phase::Map, &map_records)?;

        /* ---------- fase reduce ---------- */

        let intermediates: Vec<PathBuf> = map_outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let buckets = assign_round_robin(intermediates, self.config.reduce_tasks);

        let t_reduce = Instant::now();
        let reduce_outputs: Arc<Mutex<BTreeMap<usize, PathBuf>>> =
            Arc::new(Mutex::new(BTreeMap::new()));
        let mut handles = Vec::with_capacity(buckets.len());

        for (index, inputs) in buckets.into_iter().enumerate() {
            let outputs = Arc::clone(&reduce_outputs);
            let mut task = ReduceTask::new(index, inputs, Arc::clone(&self.config), Arc::clone(reducer))
                .on_complete(Arc::new(move |_id: &str, path: &Path| {
                    outputs
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(index, path.to_path_buf());
                }));

            debug!("{} recibe {:?}", task.id(), task.inputs());
            let id = task.id().to_string();
            let handle = self.pool.submit(TaskKind::Reduce, id.clone(), move || {
                task.execute();
                task.into_record()
            })?;
            handles.push((id, handle));
        }

        let reduce_records = self.join_phase(TaskKind::Reduce, handles).await;
        let reduce = PhaseStats::from_records(&reduce_records, t_reduce.elapsed().as_millis());
        info!(
            phase = "reduce",
            tasks = reduce.total,
            failed = reduce.failed,
            wall_ms = reduce.wall_ms as u64,
            "fase reduce terminada"
        );
        fail_if_any(Phase::Reduce, &reduce_records)?;

        let outputs = reduce_outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        Ok(PhasesOutcome {
            input_files: files.len(),
            input_lines,
            map,
            reduce,
            outputs,
        })
    }

    /// Barrera: espera a todas las tareas de la fase, sin cancelar a las
    /// hermanas si alguna falla.
    async fn join_phase(
        &self,
        kind: TaskKind,
        handles: Vec<(String, TaskHandle<TaskRecord>)>,
    ) -> Vec<TaskRecord> {
        let mut records = Vec::with_capacity(handles.len());

        for (id, handle) in handles {
            let record = match handle.join().await {
                Ok(record) => record,
                Err(e) => {
                    warn!("la tarea {} no devolvió registro: {}", id, e);
                    let mut rec = TaskRecord::new(id, kind, PathBuf::new());
                    rec.fail(e.to_string());
                    rec
                }
            };
            records.push(record);
        }
        self.pool.await_all(kind).await;

        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(records.iter().cloned());
        records
    }

    fn apply_cleanup(&self) {
        if self.config.spill_cleanup != SpillCleanup::DeleteOnSuccess {
            return;
        }
        let scratch = self.scratch_dir();
        match fs::remove_dir_all(&scratch) {
            Ok(()) => debug!("directorio temporal {} borrado", scratch.display()),
            Err(e) => warn!("no se pudo borrar {}: {}", scratch.display(), e),
        }
    }
}

struct PhasesOutcome {
    input_files: usize,
    input_lines: usize,
    map: PhaseStats,
    reduce: PhaseStats,
    outputs: Vec<PathBuf>,
}

fn fail_if_any(phase: Phase, records: &[TaskRecord]) -> Result<()> {
    let failed: Vec<String> = records
        .iter()
        .filter(|r| !r.succeeded())
        .map(|r| r.id.clone())
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(JobError::PhaseFailed { phase, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{MapContext, Mapper, ReduceContext, Reducer},
        record::Datum,
        tsv,
    };
    use std::{collections::BTreeMap, env, fs, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("scheduler_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    struct Words;

    impl Mapper<String, i64> for Words {
        fn map(&mut self, _pos: u64, line: &str, ctx: &mut MapContext<'_, String, i64>) -> anyhow::Result<()> {
            for w in line.split_whitespace() {
                if w == "boom" {
                    anyhow::bail!("palabra prohibida");
                }
                ctx.emit(w.to_string(), 1)?;
            }
            Ok(())
        }
    }

    struct Sum;

    impl Reducer for Sum {
        fn reduce(&mut self, key: &str, values: &[Datum], ctx: &mut ReduceContext<'_>) -> anyhow::Result<()> {
            let total: i64 = values.iter().filter_map(Datum::as_int).sum();
            ctx.emit(key, &total)
        }
    }

    fn wordcount(config: JobConfig) -> Scheduler<String, i64> {
        Scheduler::new(config)
            .mapper(Arc::new(|| Box::new(Words) as Box<dyn Mapper<String, i64>>))
            .reducer(Arc::new(|| Box::new(Sum) as Box<dyn Reducer>))
    }

    fn config_for(tmp: &Path) -> crate::config::JobConfigBuilder {
        JobConfig::builder()
            .input_dir(tmp.join("in"))
            .output_dir(tmp.join("out"))
            .temp_dir(tmp.join("tmp"))
            .max_threads(3)
    }

    fn write_input(tmp: &Path, name: &str, content: &str) {
        let dir = tmp.join("in");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
    }

    /// Suma los conteos de todos los part-r del job.
    fn totals(outputs: &[PathBuf]) -> BTreeMap<String, i64> {
        let mut acc = BTreeMap::new();
        for p in outputs {
            tsv::for_each_pair(p, |k, v| {
                *acc.entry(k.to_string()).or_insert(0) += v.parse::<i64>().unwrap();
            })
            .unwrap();
        }
        acc
    }

    #[test]
    fn split_lines_cubre_todas_las_lineas() {
        for total in 1..20usize {
            for m in 1..=total {
                let lines: Vec<String> = (0..total).map(|i| format!("l{i}")).collect();
                let splits = split_lines(lines.clone(), m);

                assert_eq!(splits.len(), m, "L={total} M={m}");
                let juntas: Vec<String> = splits.iter().flat_map(|s| s.lines.clone()).collect();
                assert_eq!(juntas, lines, "L={total} M={m}");
                for (i, s) in splits.iter().enumerate() {
                    assert_eq!(s.index, i);
                }
            }
        }
    }

    #[test]
    fn split_lines_ultimo_absorbe_el_resto_y_sobrantes_se_omiten() {
        let lines: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let sizes: Vec<usize> = split_lines(lines, 3).iter().map(|s| s.lines.len()).collect();
        assert_eq!(sizes, vec![3, 3, 4]);

        // más tareas que líneas: un split por línea
        let lines = vec!["a".to_string(), "b".to_string()];
        let sizes: Vec<usize> = split_lines(lines, 5).iter().map(|s| s.lines.len()).collect();
        assert_eq!(sizes, vec![1, 1]);

        assert!(split_lines(Vec::new(), 4).is_empty());
    }

    #[test]
    fn round_robin_reparte_por_indice() {
        let files: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("f{i}"))).collect();
        let buckets = assign_round_robin(files, 2);
        assert_eq!(
            buckets,
            vec![
                vec![PathBuf::from("f0"), PathBuf::from("f2"), PathBuf::from("f4")],
                vec![PathBuf::from("f1"), PathBuf::from("f3")],
            ]
        );

        let vacios = assign_round_robin(Vec::new(), 3);
        assert_eq!(vacios.len(), 3);
        assert!(vacios.iter().all(|b| b.is_empty()));
    }

    #[test]
    fn list_input_files_solo_txt_ordenados_y_read_lines_omite_vacias() {
        let tmp = temp_dir("inputs");
        write_input(&tmp, "b.txt", "tres\n\n   \ncuatro\n");
        write_input(&tmp, "a.txt", "uno\ndos\n");
        write_input(&tmp, "c.csv", "ignorado\n");

        let files = list_input_files(&tmp.join("in")).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let lines = read_lines(&files).unwrap();
        assert_eq!(lines, vec!["uno", "dos", "tres", "cuatro"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wordcount_end_to_end() {
        let tmp = temp_dir("e2e");
        write_input(&tmp, "input.txt", "the cat sat\nthe cat ran\n");

        let cfg = config_for(&tmp).map_tasks(2).reduce_tasks(2).build().unwrap();
        let sched = wordcount(cfg);
        let stats = sched.run().await.unwrap();

        assert_eq!(stats.input_lines, 2);
        assert_eq!(stats.map.total, 2);
        assert_eq!(stats.map.succeeded, 2);
        assert_eq!(stats.reduce.total, 2);
        assert_eq!(stats.reduce.succeeded, 2);
        assert_eq!(stats.map.records_out, 6);
        assert_eq!(stats.shutdown, ShutdownOutcome::Graceful);
        assert_eq!(
            stats.outputs,
            vec![
                tmp.join("out").join("part-r-00000.txt"),
                tmp.join("out").join("part-r-00001.txt"),
            ]
        );

        let esperado: BTreeMap<String, i64> = [("cat", 2), ("ran", 1), ("sat", 1), ("the", 2)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(totals(&stats.outputs), esperado);

        // cada archivo de salida está ordenado por clave
        for p in &stats.outputs {
            let content = fs::read_to_string(p).unwrap();
            let keys: Vec<&str> = content.lines().map(|l| l.split('\t').next().unwrap()).collect();
            let mut ordenadas = keys.clone();
            ordenadas.sort();
            assert_eq!(keys, ordenadas);
        }

        let st = sched.pool_status();
        assert_eq!(st.map.submitted, 2);
        assert_eq!(st.reduce.submitted, 2);
        assert!(!st.accepting);
    }

    /// Mismo resultado con un buffer enorme y con uno que hace spill en cada emit.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resultado_no_depende_de_los_spills() {
        let mut resultados = Vec::new();

        for (sub, capacity) in [("big", 1usize << 20), ("tiny", 1usize)] {
            let tmp = temp_dir(&format!("transparency_{sub}"));
            write_input(&tmp, "input.txt", "a b a\nb a\n");

            let cfg = config_for(&tmp)
                .map_tasks(1)
                .reduce_tasks(1)
                .buffer_capacity_bytes(capacity)
                .build()
                .unwrap();
            let stats = wordcount(cfg).run().await.unwrap();
            resultados.push((stats.map.spills, totals(&stats.outputs)));
        }

        assert_eq!(resultados[0].0, 0);
        assert_eq!(resultados[1].0, 5);
        let esperado: BTreeMap<String, i64> =
            [("a".to_string(), 3), ("b".to_string(), 2)].into_iter().collect();
        assert_eq!(resultados[0].1, esperado);
        assert_eq!(resultados[1].1, esperado);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fallo_en_map_no_lanza_reduce() {
        let tmp = temp_dir("map_failure");
        write_input(&tmp, "input.txt", "ok uno\nboom\nok dos\n");

        let cfg = config_for(&tmp).map_tasks(3).reduce_tasks(2).build().unwrap();
        let sched = wordcount(cfg);

        match sched.run().await {
            Err(JobError::PhaseFailed { phase, failed }) => {
                assert_eq!(phase, Phase::Map);
                assert_eq!(failed, vec!["map-task-1".to_string()]);
            }
            other => panic!("se esperaba PhaseFailed, llegó {:?}", other.map(|s| s.job_id)),
        }

        // las hermanas terminaron bien y dejaron su intermedio
        let records = sched.task_records();
        assert_eq!(records.len(), 3);
        for rec in &records {
            if rec.id == "map-task-1" {
                assert!(!rec.succeeded());
                assert!(rec.error.is_some());
            } else {
                assert!(rec.succeeded());
                assert!(rec.output_path.exists());
            }
        }

        assert_eq!(sched.pool_status().reduce.submitted, 0);
        assert!(!tmp.join("out").join("part-r-00000.txt").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn configuracion_invalida_no_ejecuta_nada() {
        let tmp = temp_dir("invalid");
        write_input(&tmp, "input.txt", "hola\n");

        // sin reducer
        let cfg = config_for(&tmp).build().unwrap();
        let sched: Scheduler<String, i64> = Scheduler::new(cfg)
            .mapper(Arc::new(|| Box::new(Words) as Box<dyn Mapper<String, i64>>));
        assert!(matches!(sched.run().await, Err(JobError::InvalidConfig(_))));
        assert_eq!(sched.pool_status().map.submitted, 0);

        // umbral fuera de rango
        let cfg = config_for(&tmp).spill_threshold(0.0).build().unwrap();
        assert!(matches!(wordcount(cfg).run().await, Err(JobError::InvalidConfig(_))));

        // entrada inexistente
        let cfg = JobConfig::builder()
            .input_dir(tmp.join("no_existe"))
            .output_dir(tmp.join("out"))
            .build()
            .unwrap();
        assert!(matches!(wordcount(cfg).run().await, Err(JobError::InvalidConfig(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_on_success_borra_el_directorio_temporal() {
        let tmp = temp_dir("cleanup");
        write_input(&tmp, "input.txt", "x y z\nx\n");

        let cfg = config_for(&tmp)
            .map_tasks(2)
            .reduce_tasks(1)
            .buffer_capacity_bytes(1)
            .spill_cleanup(SpillCleanup::DeleteOnSuccess)
            .build()
            .unwrap();
        let sched = wordcount(cfg);
        let stats = sched.run().await.unwrap();

        assert!(!sched.scratch_dir().exists());
        let esperado: BTreeMap<String, i64> = [("x", 2), ("y", 1), ("z", 1)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(totals(&stats.outputs), esperado);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn entrada_vacia_produce_salidas_vacias() {
        let tmp = temp_dir("empty_input");
        write_input(&tmp, "input.txt", "\n\n");

        let cfg = config_for(&tmp).reduce_tasks(2).build().unwrap();
        let stats = wordcount(cfg).run().await.unwrap();

        assert_eq!(stats.map.total, 0);
        assert_eq!(stats.reduce.total, 2);
        for p in &stats.outputs {
            assert!(fs::read_to_string(p).unwrap().is_empty());
        }
    }

    #[test]
    fn read_lines_reemplaza_bytes_no_utf8() {
        let tmp = temp_dir("latin1");
        let f = tmp.join("a.txt");
        fs::write(&f, b"caf\xe9 ok\r\nok\n").unwrap();

        let lines = read_lines(&[f]).unwrap();
        assert_eq!(lines, vec!["caf\u{FFFD} ok".to_string(), "ok".to_string()]);
    }

    #[test]
    fn read_lines_nombra_el_archivo_que_falla() {
        let tmp = temp_dir("missing_input");
        let err = read_lines(&[tmp.join("no_existe.txt")]).unwrap_err();
        assert!(err.to_string().contains("no_existe.txt"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn entrada_latin1_no_tumba_el_job() {
        let tmp = temp_dir("latin1_job");
        let dir = tmp.join("in");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.txt"), b"caf\xe9 ok\nok\n").unwrap();

        let cfg = config_for(&tmp).map_tasks(1).reduce_tasks(1).build().unwrap();
        let stats = wordcount(cfg).run().await.unwrap();

        let counts = totals(&stats.outputs);
        assert_eq!(counts["ok"], 2);
        assert_eq!(counts["caf\u{FFFD}"], 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fallo_en_reduce_no_cancela_a_las_hermanas() {
        struct FailsInOne;

        impl Reducer for FailsInOne {
            fn setup(&mut self, ctx: &mut ReduceContext<'_>) -> anyhow::Result<()> {
                if ctx.task_id() == "reduce-task-1" {
                    anyhow::bail!("reducer roto en {}", ctx.task_id());
                }
                Ok(())
            }

            fn reduce(&mut self, key: &str, values: &[Datum], ctx: &mut ReduceContext<'_>) -> anyhow::Result<()> {
                let total: i64 = values.iter().filter_map(Datum::as_int).sum();
                ctx.emit(key, &total)
            }
        }

        let tmp = temp_dir("reduce_failure");
        write_input(&tmp, "input.txt", "a b\nc d\ne f\n");

        let cfg = config_for(&tmp).map_tasks(3).reduce_tasks(3).build().unwrap();
        let sched: Scheduler<String, i64> = Scheduler::new(cfg)
            .mapper(Arc::new(|| Box::new(Words) as Box<dyn Mapper<String, i64>>))
            .reducer(Arc::new(|| Box::new(FailsInOne) as Box<dyn Reducer>));

        match sched.run().await {
            Err(JobError::PhaseFailed { phase, failed }) => {
                assert_eq!(phase, Phase::Reduce);
                assert_eq!(failed, vec!["reduce-task-1".to_string()]);
            }
            other => panic!("se esperaba PhaseFailed, llegó {:?}", other.map(|s| s.job_id)),
        }

        let reduces: Vec<TaskRecord> = sched
            .task_records()
            .into_iter()
            .filter(|r| r.kind == TaskKind::Reduce)
            .collect();
        assert_eq!(reduces.len(), 3);
        for rec in &reduces {
            if rec.id == "reduce-task-1" {
                assert_eq!(rec.state, crate::task::TaskState::Failed);
            } else {
                assert!(rec.succeeded(), "{} debió completar", rec.id);
                assert!(rec.output_path.exists());
            }
        }
        assert_eq!(sched.pool_status().reduce.submitted, 3);
        assert_eq!(sched.pool_status().reduce.completed, 3);
    }
}
