//! Consolidación de la salida de un job: suma los `part-r-*` en un único
//! `<base>_out.txt` y archiva los parts en el directorio temporal.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use glob::{glob, Pattern};
use serde::Serialize;
use tracing::{info, warn};

use engine::{scheduler::list_input_files, tsv};

pub const DEFAULT_BASE_NAME: &str = "result";

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub merged_path: PathBuf,
    pub part_files: usize,
    pub unique_keys: usize,
    /// Líneas descartadas por formato o por valor no numérico.
    pub skipped: u64,
}

/// `part-r-*.txt` del directorio de salida, ordenados por nombre.
pub fn part_files(output_dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/part-r-*.txt",
        Pattern::escape(&output_dir.to_string_lossy())
    );
    let mut files = Vec::new();
    for entry in glob(&pattern).with_context(|| format!("patrón inválido {pattern}"))? {
        let path = entry?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Nombre base del archivo consolidado: el stem del primer `.txt` de la
/// entrada, o `result` si no hay ninguno.
pub fn base_name(input_dir: &Path) -> String {
    list_input_files(input_dir)
        .ok()
        .and_then(|files| files.into_iter().next())
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_else(|| DEFAULT_BASE_NAME.to_string())
}

/// Suma por clave los valores enteros de todos los parts y escribe
/// `<output_dir>/<base>_out.txt`. Devuelve `None` si no hay parts.
pub fn merge_parts(output_dir: &Path, base: &str) -> Result<Option<(MergeSummary, Vec<PathBuf>)>> {
    let parts = part_files(output_dir)?;
    if parts.is_empty() {
        warn!("no hay archivos part-r-* en {}", output_dir.display());
        return Ok(None);
    }

    let merged_path = output_dir.join(format!("{base}_out.txt"));
    info!(
        "consolidando {} archivos en {}",
        parts.len(),
        merged_path.display()
    );

    let mut totals: BTreeMap<String, i64> = BTreeMap::new();
    let mut skipped = 0u64;

    for part in &parts {
        let summary = tsv::for_each_pair(part, |key, value| match value.trim().parse::<i64>() {
            Ok(n) => *totals.entry(key.to_string()).or_insert(0) += n,
            Err(_) => {
                warn!("conteo inválido en {}: {}\t{}", part.display(), key, value);
                skipped += 1;
            }
        })
        .with_context(|| format!("lectura de {}", part.display()))?;

        if summary.skipped > 0 {
            warn!(
                "{} líneas mal formadas en {}",
                summary.skipped,
                part.display()
            );
            skipped += summary.skipped;
        }
    }

    tsv::write_pairs(&merged_path, totals.iter())
        .with_context(|| format!("escritura de {}", merged_path.display()))?;

    let summary = MergeSummary {
        merged_path,
        part_files: parts.len(),
        unique_keys: totals.len(),
        skipped,
    };
    info!("{} claves únicas consolidadas", summary.unique_keys);
    Ok(Some((summary, parts)))
}

/// Mueve los parts a `<temp_dir>/parts/`, pisando lo que hubiera.
/// Un part que no se puede mover se reporta y se deja donde está.
pub fn archive_parts(parts: &[PathBuf], temp_dir: &Path) -> Result<usize> {
    let dest_dir = temp_dir.join("parts");
    fs::create_dir_all(&dest_dir)
        .with_context(|| format!("no se pudo crear {}", dest_dir.display()))?;

    let mut moved = 0;
    for part in parts {
        let Some(name) = part.file_name() else {
            continue;
        };
        let target = dest_dir.join(name);
        match move_file(part, &target) {
            Ok(()) => moved += 1,
            Err(e) => warn!("no se pudo mover {}: {}", part.display(), e),
        }
    }
    Ok(moved)
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_file(to)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // rename no cruza sistemas de archivos
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Consolidación completa: merge + archivo de los parts.
pub fn reconcile(output_dir: &Path, base: &str, temp_dir: &Path) -> Result<Option<MergeSummary>> {
    let Some((summary, parts)) = merge_parts(output_dir, base)? else {
        return Ok(None);
    };
    let moved = archive_parts(&parts, temp_dir)?;
    info!(
        "{} de {} parts movidos a {}",
        moved,
        parts.len(),
        temp_dir.join("parts").display()
    );
    Ok(Some(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("report_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn base_name_usa_el_primer_txt() {
        let tmp = temp_dir("base");
        let input = tmp.join("in");
        fs::create_dir_all(&input).unwrap();
        assert_eq!(base_name(&input), "result");

        fs::write(input.join("zeta.txt"), "x").unwrap();
        fs::write(input.join("alfa.txt"), "x").unwrap();
        fs::write(input.join("aaa.csv"), "x").unwrap();
        assert_eq!(base_name(&input), "alfa");

        assert_eq!(base_name(&tmp.join("no_existe")), "result");
    }

    #[test]
    fn reconcile_suma_entre_parts_y_los_archiva() {
        let tmp = temp_dir("reconcile");
        let out = tmp.join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("part-r-00000.txt"), "cat\t1\nthe\t2\nbad\tx\n").unwrap();
        fs::write(out.join("part-r-00001.txt"), "cat\t1\nran\t1\nsin_tab\n\nsat\t1\n").unwrap();
        fs::write(out.join("otro.txt"), "cat\t100\n").unwrap();

        let scratch = tmp.join("tmp");
        let summary = reconcile(&out, "input", &scratch).unwrap().unwrap();

        assert_eq!(summary.part_files, 2);
        assert_eq!(summary.unique_keys, 4);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.merged_path, out.join("input_out.txt"));
        assert_eq!(
            fs::read_to_string(&summary.merged_path).unwrap(),
            "cat\t2\nran\t1\nsat\t1\nthe\t2\n"
        );

        assert!(!out.join("part-r-00000.txt").exists());
        assert!(scratch.join("parts").join("part-r-00000.txt").exists());
        assert!(scratch.join("parts").join("part-r-00001.txt").exists());
        assert!(out.join("otro.txt").exists());
    }

    #[test]
    fn sin_parts_no_hace_nada() {
        let tmp = temp_dir("empty");
        assert!(reconcile(&tmp, "x", &tmp.join("tmp")).unwrap().is_none());
        assert!(!tmp.join("x_out.txt").exists());
    }

    #[test]
    fn archivar_pisa_parts_anteriores() {
        let tmp = temp_dir("overwrite");
        let scratch = tmp.join("tmp");
        fs::create_dir_all(scratch.join("parts")).unwrap();
        fs::write(scratch.join("parts").join("part-r-00000.txt"), "viejo").unwrap();

        let part = tmp.join("part-r-00000.txt");
        fs::write(&part, "nuevo\t1\n").unwrap();

        assert_eq!(archive_parts(&[part.clone()], &scratch).unwrap(), 1);
        assert!(!part.exists());
        assert_eq!(
            fs::read_to_string(scratch.join("parts").join("part-r-00000.txt")).unwrap(),
            "nuevo\t1\n"
        );
    }
}
