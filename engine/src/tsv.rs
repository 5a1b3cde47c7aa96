//! Archivos de texto `clave\tvalor`, una pareja por línea.
//!
//! Es el formato de los intermedios (salida de map) y de los `part-r-*`.
//! Se lee y escribe con el crate `csv` configurado con tab, sin comillas
//! ni encabezados.

use std::{
    fmt::{Display, Write as _},
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use csv::{QuoteStyle, ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use tracing::debug;

/// Writer de parejas clave/valor separadas por tab.
pub struct TsvWriter {
    inner: csv::Writer<File>,
    path: PathBuf,
    key_buf: String,
    value_buf: String,
    written: u64,
}

impl TsvWriter {
    /// Crea (o trunca) el archivo, creando la carpeta padre si hace falta.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(path)?;
        let inner = WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(QuoteStyle::Never)
            .terminator(Terminator::Any(b'\n'))
            .has_headers(false)
            .from_writer(file);

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            key_buf: String::new(),
            value_buf: String::new(),
            written: 0,
        })
    }

    pub fn write_pair<K, V>(&mut self, key: &K, value: &V) -> io::Result<()>
    where
        K: Display + ?Sized,
        V: Display + ?Sized,
    {
        self.key_buf.clear();
        self.value_buf.clear();
        write!(self.key_buf, "{key}").map_err(fmt_err)?;
        write!(self.value_buf, "{value}").map_err(fmt_err)?;

        // sin comillas, un separador dentro de un campo parte la línea en otra pareja
        if self.key_buf.contains(['\t', '\r', '\n']) {
            return Err(invalid_field("clave", &self.key_buf, &self.path));
        }
        if self.value_buf.contains(['\r', '\n']) {
            return Err(invalid_field("valor", &self.value_buf, &self.path));
        }

        self.inner
            .write_record([self.key_buf.as_str(), self.value_buf.as_str()])?;
        self.written += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Vacía el buffer a disco y devuelve cuántas parejas se escribieron.
    pub fn finish(mut self) -> io::Result<u64> {
        self.inner.flush()?;
        Ok(self.written)
    }
}

fn invalid_field(what: &str, field: &str, path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{what} con tab o salto de línea no se puede escribir en {}: {field:?}", path.display()),
    )
}

fn fmt_err(e: std::fmt::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("error formateando registro: {e}"))
}

/// Resumen de una lectura.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadSummary {
    pub pairs: u64,
    pub skipped: u64,
}

/// Recorre un archivo `clave\tvalor` llamando a `f` por cada pareja.
///
/// La línea se corta en el primer tab: todo lo que sigue es el valor,
/// aunque contenga más tabs. Las líneas vacías o sin tab se saltan.
pub fn for_each_pair<F>(path: impl AsRef<Path>, mut f: F) -> io::Result<ReadSummary>
where
    F: FnMut(&str, &str),
{
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quoting(false)
        .flexible(true)
        .from_path(path)?;

    let mut summary = ReadSummary::default();
    let mut record = StringRecord::new();
    let mut value = String::new();

    while reader.read_record(&mut record)? {
        if record.len() < 2 {
            let blank = record.iter().all(|s| s.trim().is_empty());
            if !blank {
                debug!(
                    "línea sin separador en {}: {:?}",
                    path.display(),
                    record.get(0).unwrap_or_default()
                );
                summary.skipped += 1;
            }
            continue;
        }

        value.clear();
        for (i, field) in record.iter().skip(1).enumerate() {
            if i > 0 {
                value.push('\t');
            }
            value.push_str(field);
        }

        f(&record[0], &value);
        summary.pairs += 1;
    }

    Ok(summary)
}

/// Escribe todas las parejas de un iterador y cierra el archivo.
pub fn write_pairs<I, K, V>(path: impl AsRef<Path>, pairs: I) -> io::Result<u64>
where
    I: IntoIterator<Item = (K, V)>,
    K: Display,
    V: Display,
{
    let mut writer = TsvWriter::create(path)?;
    for (k, v) in pairs {
        writer.write_pair(&k, &v)?;
    }
    writer.finish()
}
