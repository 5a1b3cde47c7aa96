use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{JobError, Result};

pub const DEFAULT_MAP_TASKS: usize = 4;
pub const DEFAULT_REDUCE_TASKS: usize = 2;
pub const DEFAULT_BUFFER_KB: usize = 1024;
pub const DEFAULT_SPILL_THRESHOLD: f64 = 0.8;
pub const DEFAULT_MAX_THREADS: usize = 8;
pub const DEFAULT_TEMP_DIR: &str = "temp";
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/* =========================
   Claves de propiedades
   ========================= */

pub const KEY_INPUT_DIR: &str = "mapreduce.input.dir";
pub const KEY_OUTPUT_DIR: &str = "mapreduce.output.dir";
pub const KEY_TEMP_DIR: &str = "mapreduce.temp.dir";
pub const KEY_MAP_TASKS: &str = "mapreduce.map.tasks";
pub const KEY_REDUCE_TASKS: &str = "mapreduce.reduce.tasks";
pub const KEY_BUFFER_KB: &str = "mapreduce.buffer.size.kb";
pub const KEY_SPILL_THRESHOLD: &str = "mapreduce.spill.threshold";
pub const KEY_MAX_THREADS: &str = "mapreduce.thread.pool.size";
pub const KEY_MONITORING: &str = "mapreduce.monitoring.enabled";
pub const KEY_SPILL_CLEANUP: &str = "mapreduce.spill.cleanup";
pub const KEY_SHUTDOWN_TIMEOUT: &str = "mapreduce.shutdown.timeout.secs";

const KNOWN_KEYS: [&str; 11] = [
    KEY_INPUT_DIR,
    KEY_OUTPUT_DIR,
    KEY_TEMP_DIR,
    KEY_MAP_TASKS,
    KEY_REDUCE_TASKS,
    KEY_BUFFER_KB,
    KEY_SPILL_THRESHOLD,
    KEY_MAX_THREADS,
    KEY_MONITORING,
    KEY_SPILL_CLEANUP,
    KEY_SHUTDOWN_TIMEOUT,
];

/// Nombre de la env var que sobreescribe una clave:
/// `mapreduce.map.tasks` -> `MAPREDUCE_MAP_TASKS`.
pub fn env_var_name(key: &str) -> String {
    key.to_ascii_uppercase().replace('.', "_")
}

/// Qué hacer con los runs de spill y los archivos intermedios
/// cuando el trabajo termina bien.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpillCleanup {
    Retain,
    DeleteOnSuccess,
}

impl FromStr for SpillCleanup {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retain" | "keep" => Ok(SpillCleanup::Retain),
            "delete" | "delete-on-success" | "delete_on_success" => {
                Ok(SpillCleanup::DeleteOnSuccess)
            }
            other => Err(JobError::InvalidConfig(format!(
                "política de limpieza desconocida: {other}"
            ))),
        }
    }
}

impl fmt::Display for SpillCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpillCleanup::Retain => f.write_str("retain"),
            SpillCleanup::DeleteOnSuccess => f.write_str("delete"),
        }
    }
}

/// Configuración inmutable de un job. Se construye una sola vez con
/// [`JobConfigBuilder`] y después sólo se lee.
#[derive(Debug, Clone, Serialize)]
pub struct JobConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Base de los directorios de trabajo (spills, intermedios).
    pub temp_dir: PathBuf,
    pub map_tasks: usize,
    pub reduce_tasks: usize,
    /// Capacidad del buffer de cada tarea map, en bytes estimados.
    pub buffer_capacity_bytes: usize,
    /// Fracción de la capacidad que dispara el spill, en (0, 1].
    pub spill_threshold: f64,
    /// Presupuesto total de hilos, repartido 2:1 entre map y reduce.
    pub max_threads: usize,
    pub monitoring: bool,
    pub spill_cleanup: SpillCleanup,
    pub shutdown_timeout: Duration,
}

impl JobConfig {
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder::new()
    }

    /// Revisa que la configuración sea ejecutable antes de lanzar tareas.
    pub fn validate(&self) -> Result<()> {
        if self.input_dir.as_os_str().is_empty() {
            return Err(invalid("directorio de entrada no definido"));
        }
        if !self.input_dir.is_dir() {
            return Err(invalid(format!(
                "el directorio de entrada no existe: {}",
                self.input_dir.display()
            )));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(invalid("directorio de salida no definido"));
        }
        if self.map_tasks == 0 {
            return Err(invalid("map_tasks debe ser > 0"));
        }
        if self.reduce_tasks == 0 {
            return Err(invalid("reduce_tasks debe ser > 0"));
        }
        if self.buffer_capacity_bytes == 0 {
            return Err(invalid("el tamaño del buffer debe ser > 0"));
        }
        if !(self.spill_threshold > 0.0 && self.spill_threshold <= 1.0) {
            return Err(invalid(format!(
                "spill_threshold fuera de rango (0, 1]: {}",
                self.spill_threshold
            )));
        }
        if self.max_threads == 0 {
            return Err(invalid("max_threads debe ser > 0"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> JobError {
    JobError::InvalidConfig(msg.into())
}

/* =========================
   Builder por capas
   ========================= */

/// Builder de [`JobConfig`]. Cada capa que se aplica pisa a las anteriores,
/// así que el orden de llamadas define la precedencia:
/// defaults < archivo de propiedades < env vars < overrides explícitos.
#[derive(Debug, Clone, Default)]
pub struct JobConfigBuilder {
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    map_tasks: Option<usize>,
    reduce_tasks: Option<usize>,
    buffer_capacity_bytes: Option<usize>,
    spill_threshold: Option<f64>,
    max_threads: Option<usize>,
    monitoring: Option<bool>,
    spill_cleanup: Option<SpillCleanup>,
    shutdown_timeout: Option<Duration>,
}

impl JobConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = Some(dir.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn map_tasks(mut self, n: usize) -> Self {
        self.map_tasks = Some(n);
        self
    }

    pub fn reduce_tasks(mut self, n: usize) -> Self {
        self.reduce_tasks = Some(n);
        self
    }

    pub fn buffer_kb(mut self, kb: usize) -> Self {
        self.buffer_capacity_bytes = Some(kb.saturating_mul(1024));
        self
    }

    pub fn buffer_capacity_bytes(mut self, bytes: usize) -> Self {
        self.buffer_capacity_bytes = Some(bytes);
        self
    }

    pub fn spill_threshold(mut self, threshold: f64) -> Self {
        self.spill_threshold = Some(threshold);
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n);
        self
    }

    pub fn monitoring(mut self, enabled: bool) -> Self {
        self.monitoring = Some(enabled);
        self
    }

    pub fn spill_cleanup(mut self, policy: SpillCleanup) -> Self {
        self.spill_cleanup = Some(policy);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Aplica un archivo `clave=valor` encima de lo que ya haya.
    pub fn properties_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            invalid(format!(
                "no se pudo leer el archivo de propiedades {}: {e}",
                path.display()
            ))
        })?;
        self.properties(&parse_properties(&text))
    }

    /// Aplica un mapa de propiedades ya parseado.
    pub fn properties(mut self, props: &BTreeMap<String, String>) -> Result<Self> {
        for (key, value) in props {
            self.set(key, value)?;
        }
        Ok(self)
    }

    /// Aplica las env vars `MAPREDUCE_*` del proceso.
    pub fn env(self) -> Result<Self> {
        self.env_from(|name| std::env::var(name).ok())
    }

    /// Igual que [`env`](Self::env) pero con una función de búsqueda
    /// inyectable (los tests no tocan el entorno real).
    pub fn env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in KNOWN_KEYS {
            if let Some(value) = lookup(&env_var_name(key)) {
                self.set(key, &value)?;
            }
        }
        Ok(self)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            KEY_INPUT_DIR => self.input_dir = Some(PathBuf::from(value)),
            KEY_OUTPUT_DIR => self.output_dir = Some(PathBuf::from(value)),
            KEY_TEMP_DIR => self.temp_dir = Some(PathBuf::from(value)),
            KEY_MAP_TASKS => self.map_tasks = Some(parse_value(key, value)?),
            KEY_REDUCE_TASKS => self.reduce_tasks = Some(parse_value(key, value)?),
            KEY_BUFFER_KB => {
                let kb: usize = parse_value(key, value)?;
                self.buffer_capacity_bytes = Some(kb.saturating_mul(1024));
            }
            KEY_SPILL_THRESHOLD => self.spill_threshold = Some(parse_value(key, value)?),
            KEY_MAX_THREADS => self.max_threads = Some(parse_value(key, value)?),
            KEY_MONITORING => self.monitoring = Some(parse_bool(key, value)?),
            KEY_SPILL_CLEANUP => self.spill_cleanup = Some(value.parse()?),
            KEY_SHUTDOWN_TIMEOUT => {
                let secs: u64 = parse_value(key, value)?;
                self.shutdown_timeout = Some(Duration::from_secs(secs));
            }
            other => debug!("propiedad desconocida ignorada: {}", other),
        }
        Ok(())
    }

    /// Completa con defaults. Sólo exige los directorios de entrada y salida;
    /// los rangos se revisan en [`JobConfig::validate`].
    pub fn build(self) -> Result<JobConfig> {
        let input_dir = self
            .input_dir
            .ok_or_else(|| invalid("directorio de entrada no definido"))?;
        let output_dir = self
            .output_dir
            .ok_or_else(|| invalid("directorio de salida no definido"))?;

        Ok(JobConfig {
            input_dir,
            output_dir,
            temp_dir: self
                .temp_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR)),
            map_tasks: self.map_tasks.unwrap_or(DEFAULT_MAP_TASKS),
            reduce_tasks: self.reduce_tasks.unwrap_or(DEFAULT_REDUCE_TASKS),
            buffer_capacity_bytes: self
                .buffer_capacity_bytes
                .unwrap_or(DEFAULT_BUFFER_KB * 1024),
            spill_threshold: self.spill_threshold.unwrap_or(DEFAULT_SPILL_THRESHOLD),
            max_threads: self.max_threads.unwrap_or(DEFAULT_MAX_THREADS),
            monitoring: self.monitoring.unwrap_or(true),
            spill_cleanup: self.spill_cleanup.unwrap_or(SpillCleanup::Retain),
            shutdown_timeout: self
                .shutdown_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)),
        })
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| invalid(format!("valor inválido para {key}: {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(format!("valor booleano inválido para {key}: {value:?}"))),
    }
}

/// Parsea un archivo estilo `.properties`:
/// - una entrada `clave=valor` (o `clave: valor`) por línea
/// - líneas vacías y comentarios (`#`, `!`) se ignoran
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let Some(idx) = line.find(|c: char| c == '=' || c == ':') else {
            debug!("línea de propiedades sin separador: {}", line);
            continue;
        };
        let key = line[..idx].trim();
        let value = line[idx + 1..].trim();
        if !key.is_empty() {
            out.insert(key.to_string(), value.to_string());
        }
    }

    out
}
