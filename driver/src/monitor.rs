use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::Serialize;
use sysinfo::{CpuExt, System, SystemExt};
use tracing::{debug, info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Snapshot {
    pub elapsed_ms: u128,
    pub cpu_percent: f32,
    pub mem_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSummary {
    pub samples: usize,
    pub total_ms: u128,
    pub peak_mem_bytes: u64,
    pub avg_mem_bytes: u64,
    pub peak_cpu_percent: f32,
    pub avg_cpu_percent: f32,
}

impl MonitorSummary {
    pub fn from_snapshots(snapshots: &[Snapshot], total_ms: u128) -> Self {
        if snapshots.is_empty() {
            return Self {
                total_ms,
                ..Self::default()
            };
        }

        let n = snapshots.len();
        let mem_sum: u64 = snapshots.iter().map(|s| s.mem_bytes).sum();
        let cpu_sum: f32 = snapshots.iter().map(|s| s.cpu_percent).sum();

        Self {
            samples: n,
            total_ms,
            peak_mem_bytes: snapshots.iter().map(|s| s.mem_bytes).max().unwrap_or(0),
            avg_mem_bytes: mem_sum / n as u64,
            peak_cpu_percent: snapshots.iter().map(|s| s.cpu_percent).fold(0.0, f32::max),
            avg_cpu_percent: cpu_sum / n as f32,
        }
    }

    pub fn log(&self) {
        info!(
            "monitor: {} muestras en {} ms | memoria pico {:.1} MB, promedio {:.1} MB | cpu pico {:.1}%, promedio {:.1}%",
            self.samples,
            self.total_ms,
            mb(self.peak_mem_bytes),
            mb(self.avg_mem_bytes),
            self.peak_cpu_percent,
            self.avg_cpu_percent
        );
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Muestreador en segundo plano de CPU y memoria mientras corre un job.
pub struct PerfMonitor {
    stop: Arc<AtomicBool>,
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
    started: Instant,
    handle: Option<JoinHandle<()>>,
}

impl PerfMonitor {
    pub fn start(interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        let thread_stop = Arc::clone(&stop);
        let thread_snapshots = Arc::clone(&snapshots);

        let handle = thread::Builder::new()
            .name("perf-monitor".to_string())
            .spawn(move || {
                let mut sys = System::new_all();
                loop {
                    sys.refresh_cpu();
                    sys.refresh_memory();

                    let snap = Snapshot {
                        elapsed_ms: started.elapsed().as_millis(),
                        cpu_percent: sys.global_cpu_info().cpu_usage(),
                        // en sysinfo 0.29 used_memory ya viene en bytes
                        mem_bytes: sys.used_memory(),
                    };
                    thread_snapshots
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(snap);

                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(interval);
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                }
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("no se pudo lanzar el monitor: {}", e);
                None
            }
        };
        debug!("monitor iniciado cada {:?}", interval);

        Self {
            stop,
            snapshots,
            started,
            handle,
        }
    }

    /// Detiene el muestreo y resume lo observado.
    pub fn stop(mut self) -> MonitorSummary {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("el hilo del monitor terminó con panic");
            }
        }

        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        MonitorSummary::from_snapshots(&snapshots, self.started.elapsed().as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumen_calcula_pico_y_promedio() {
        let snaps = [
            Snapshot { elapsed_ms: 0, cpu_percent: 10.0, mem_bytes: 100 },
            Snapshot { elapsed_ms: 5, cpu_percent: 30.0, mem_bytes: 300 },
        ];
        let s = MonitorSummary::from_snapshots(&snaps, 7);

        assert_eq!(s.samples, 2);
        assert_eq!(s.total_ms, 7);
        assert_eq!(s.peak_mem_bytes, 300);
        assert_eq!(s.avg_mem_bytes, 200);
        assert_eq!(s.peak_cpu_percent, 30.0);
        assert_eq!(s.avg_cpu_percent, 20.0);
    }

    #[test]
    fn resumen_sin_muestras() {
        let s = MonitorSummary::from_snapshots(&[], 3);
        assert_eq!(s.samples, 0);
        assert_eq!(s.avg_mem_bytes, 0);
    }

    #[test]
    fn monitor_toma_al_menos_una_muestra() {
        let monitor = PerfMonitor::start(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(30));
        let summary = monitor.stop();

        assert!(summary.samples >= 1);
        assert!(summary.peak_mem_bytes > 0);
    }
}
