use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use engine::{config::DEFAULT_TEMP_DIR, JobConfig, JobStatistics, Scheduler, SpillCleanup};

use crate::{
    generate::{parse_frequency, Generator},
    monitor::{MonitorSummary, PerfMonitor, DEFAULT_INTERVAL},
    report::{self, MergeSummary, DEFAULT_BASE_NAME},
    wordcount::job_factories,
};

#[derive(Parser)]
#[command(name = "driver")]
#[command(about = "Ejecuta jobs MapReduce locales sobre un directorio de textos")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Corre un job completo y consolida la salida
    Run(RunArgs),
    /// Sólo consolida los part-r-* que ya estén en un directorio de salida
    Merge {
        #[arg(value_name = "OUTPUT_DIR")]
        output_dir: PathBuf,

        /// Nombre base del archivo consolidado (<base>_out.txt)
        #[arg(long, default_value = DEFAULT_BASE_NAME)]
        name: String,

        /// Dónde archivar los parts (se mueven a <temp-dir>/parts)
        #[arg(long, default_value = DEFAULT_TEMP_DIR)]
        temp_dir: PathBuf,
    },
    /// Genera textos de prueba en un directorio
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    /// Líneas por archivo aleatorio (0 = ninguno)
    #[arg(long, default_value_t = 500)]
    pub lines: usize,

    /// Con 1 se escribe generated_test.txt; con más, test001.txt, test002.txt, ...
    #[arg(long, default_value_t = 1)]
    pub files: usize,

    /// Semilla para salida reproducible
    #[arg(long)]
    pub seed: Option<u64>,

    /// Palabra con frecuencia exacta (repetible): --freq hola=10
    #[arg(long = "freq", value_name = "PALABRA=N")]
    pub frequencies: Vec<String>,

    /// Agrega el juego de datos por defecto (test.txt, frequency_test.txt, 3 archivos)
    #[arg(long)]
    pub defaults: bool,
}

fn generate(args: &GenerateArgs) -> Result<()> {
    let frequencies = args
        .frequencies
        .iter()
        .map(|raw| parse_frequency(raw))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let mut generator = Generator::new(args.seed);
    if args.lines > 0 {
        if args.files <= 1 {
            generator.text_file(&args.dir.join("generated_test.txt"), args.lines)?;
        } else {
            generator.multiple_files(&args.dir, args.files, args.lines)?;
        }
    }
    if !frequencies.is_empty() {
        generator.frequency_file(&args.dir.join("frequency_test.txt"), &frequencies)?;
    }
    if args.defaults {
        generator.default_data(&args.dir)?;
    }
    println!("Datos de prueba generados en {}", args.dir.display());
    Ok(())
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(value_name = "INPUT_DIR")]
    pub input_dir: PathBuf,

    #[arg(value_name = "OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Job a ejecutar
    #[arg(long, default_value = "wordcount")]
    pub job: String,

    #[arg(long)]
    pub map_tasks: Option<usize>,

    #[arg(long)]
    pub reduce_tasks: Option<usize>,

    /// Capacidad del buffer de cada tarea map, en KB
    #[arg(long)]
    pub buffer_kb: Option<usize>,

    /// Fracción de la capacidad que dispara un spill (0, 1]
    #[arg(long)]
    pub spill_threshold: Option<f64>,

    #[arg(long)]
    pub max_threads: Option<usize>,

    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Archivo .properties con la configuración base
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub no_monitoring: bool,

    /// Borra los runs y el directorio temporal del job si termina bien
    #[arg(long)]
    pub delete_spills: bool,

    /// Imprime las estadísticas como JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// defaults < archivo < env MAPREDUCE_* < flags
    pub fn to_config(&self) -> Result<JobConfig> {
        let mut builder = JobConfig::builder();
        if let Some(path) = &self.config {
            builder = builder
                .properties_file(path)
                .with_context(|| format!("leyendo {}", path.display()))?;
        }
        builder = builder.env()?;

        builder = builder
            .input_dir(&self.input_dir)
            .output_dir(&self.output_dir);
        if let Some(n) = self.map_tasks {
            builder = builder.map_tasks(n);
        }
        if let Some(n) = self.reduce_tasks {
            builder = builder.reduce_tasks(n);
        }
        if let Some(kb) = self.buffer_kb {
            builder = builder.buffer_kb(kb);
        }
        if let Some(t) = self.spill_threshold {
            builder = builder.spill_threshold(t);
        }
        if let Some(n) = self.max_threads {
            builder = builder.max_threads(n);
        }
        if let Some(dir) = &self.temp_dir {
            builder = builder.temp_dir(dir);
        }
        if self.no_monitoring {
            builder = builder.monitoring(false);
        }
        if self.delete_spills {
            builder = builder.spill_cleanup(SpillCleanup::DeleteOnSuccess);
        }

        Ok(builder.build()?)
    }
}

#[derive(Serialize)]
struct RunReport {
    stats: JobStatistics,
    merged: Option<MergeSummary>,
    monitor: Option<MonitorSummary>,
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run_job(args).await,
        Commands::Generate(args) => generate(&args),
        Commands::Merge {
            output_dir,
            name,
            temp_dir,
        } => match report::reconcile(&output_dir, &name, &temp_dir)? {
            Some(summary) => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(())
            }
            None => {
                println!("No hay archivos part-r-* en {}", output_dir.display());
                Ok(())
            }
        },
    }
}

async fn run_job(args: RunArgs) -> Result<()> {
    let config = args.to_config()?;
    let (mapper, reducer) = job_factories(&args.job)?;

    let input_dir = config.input_dir.clone();
    let output_dir = config.output_dir.clone();
    let temp_dir = config.temp_dir.clone();
    let monitor = config.monitoring.then(|| PerfMonitor::start(DEFAULT_INTERVAL));

    let scheduler = Scheduler::new(config).mapper(mapper).reducer(reducer);
    info!("job {} ({}) enviado", scheduler.job_id(), args.job);

    let result = scheduler.run().await;
    let perf = monitor.map(PerfMonitor::stop);
    if let Some(p) = &perf {
        p.log();
    }
    let stats = result?;

    let merged = match report::reconcile(&output_dir, &report::base_name(&input_dir), &temp_dir) {
        Ok(summary) => summary,
        Err(e) => {
            warn!("no se pudo consolidar la salida: {:#}", e);
            None
        }
    };

    if args.json {
        let report = RunReport {
            stats,
            merged,
            monitor: perf,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Job {} completado en {} ms", stats.job_id, stats.duration_ms);
    println!(
        "  map:    {} tareas, {} líneas, {} parejas, {} spills ({} ms)",
        stats.map.total, stats.map.records_in, stats.map.records_out, stats.map.spills, stats.map.wall_ms
    );
    println!(
        "  reduce: {} tareas, {} parejas leídas, {} escritas ({} ms)",
        stats.reduce.total, stats.reduce.records_in, stats.reduce.records_out, stats.reduce.wall_ms
    );
    if let Some(m) = &merged {
        println!(
            "  salida: {} ({} claves únicas)",
            m.merged_path.display(),
            m.unique_keys
        );
    }
    Ok(())
}
