//! Runs de spill en disco y merge k-way.
//!
//! Cada spill ordena las entradas por clave (orden estable) y las escribe en
//! un run binario inmutable:
//!
//! ```text
//! [count u64 LE] ([klen u32 LE][vlen u32 LE][key bytes][value bytes])*
//! ```
//!
//! Clave y valor se guardan como JSON (`serde_json`). Al terminar la tarea,
//! `merge_all` combina todos los runs en un único archivo de texto ordenado
//! manteniendo en memoria sólo una entrada por run.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{
    record::{Entry, SortKey, Payload},
    tsv::TsvWriter,
};

/// Metadatos de un run ya escrito.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillRun {
    pub path: PathBuf,
    pub entries: u64,
}

/// Almacén de runs de una sola tarea map.
pub struct SpillStore<K, V> {
    dir: PathBuf,
    prefix: String,
    runs: Vec<SpillRun>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: SortKey, V: Payload> SpillStore<K, V> {
    /// `prefix` distingue los runs de distintas tareas en el mismo directorio.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            runs: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn runs(&self) -> &[SpillRun] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Ordena las entradas por clave y las escribe como un run nuevo.
    pub fn spill(&mut self, mut entries: Vec<Entry<K, V>>) -> io::Result<&SpillRun> {
        fs::create_dir_all(&self.dir)?;

        // sort_by es estable: claves iguales quedan en orden de llegada
        entries.sort_by(|a, b| a.key().cmp(b.key()));

        let path = self
            .dir
            .join(format!("spill_{}_{}.run", self.prefix, self.runs.len()));
        let mut writer = BufWriter::new(File::create(&path)?);

        writer.write_all(&(entries.len() as u64).to_le_bytes())?;
        for entry in &entries {
            let k = encode(entry.key(), &path)?;
            let v = encode(entry.value(), &path)?;
            writer.write_all(&frame_len(k.len(), &path)?.to_le_bytes())?;
            writer.write_all(&frame_len(v.len(), &path)?.to_le_bytes())?;
            writer.write_all(&k)?;
            writer.write_all(&v)?;
        }
        writer.flush()?;

        debug!(
            "spill #{} de {}: {} entradas -> {}",
            self.runs.len(),
            self.prefix,
            entries.len(),
            path.display()
        );

        self.runs.push(SpillRun {
            path,
            entries: entries.len() as u64,
        });
        Ok(&self.runs[self.runs.len() - 1])
    }

    /// Merge k-way de todos los runs a un archivo `clave\tvalor` ordenado.
    /// Devuelve la cantidad de entradas escritas. Los runs no se borran.
    pub fn merge_all(&self, output: impl AsRef<Path>) -> io::Result<u64> {
        let output = output.as_ref();
        let mut writer = TsvWriter::create(output)?;

        let mut cursors: Vec<Option<RunCursor<K, V>>> = Vec::with_capacity(self.runs.len());
        let mut heap: BinaryHeap<HeapItem<K, V>> = BinaryHeap::with_capacity(self.runs.len());

        for (idx, run) in self.runs.iter().enumerate() {
            let mut cursor = RunCursor::open(&run.path)?;
            match cursor.next_entry()? {
                Some((key, value)) => {
                    heap.push(HeapItem { key, value, run: idx });
                    cursors.push(Some(cursor));
                }
                None => cursors.push(None),
            }
        }

        while let Some(HeapItem { key, value, run }) = heap.pop() {
            writer.write_pair(&key, &value)?;

            if let Some(cursor) = cursors[run].as_mut() {
                match cursor.next_entry()? {
                    Some((key, value)) => heap.push(HeapItem { key, value, run }),
                    // run agotado: se suelta el cursor y se cierra el archivo
                    None => cursors[run] = None,
                }
            }
        }

        let written = writer.finish()?;
        debug!(
            "merge de {} runs de {} -> {} ({} entradas)",
            self.runs.len(),
            self.prefix,
            output.display(),
            written
        );
        Ok(written)
    }

    /// Borra los archivos de todos los runs y olvida sus metadatos.
    pub fn remove_runs(&mut self) {
        for run in self.runs.drain(..) {
            if let Err(e) = fs::remove_file(&run.path) {
                warn!("no se pudo borrar el run {}: {}", run.path.display(), e);
            }
        }
    }
}

fn encode<T: Serialize>(value: &T, path: &Path) -> io::Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("error serializando entrada para {}: {e}", path.display()),
        )
    })
}

fn frame_len(len: usize, path: &Path) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("entrada demasiado grande para {}: {len} bytes", path.display()),
        )
    })
}

/* =========================
   Cursor de lectura de un run
   ========================= */

/// Lector secuencial de un run. Sólo avanza.
pub struct RunCursor<K, V> {
    reader: BufReader<File>,
    path: PathBuf,
    remaining: u64,
    buf: Vec<u8>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: DeserializeOwned, V: DeserializeOwned> RunCursor<K, V> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);

        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;

        Ok(Self {
            reader,
            path,
            remaining: u64::from_le_bytes(header),
            buf: Vec::new(),
            _marker: PhantomData,
        })
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn next_entry(&mut self) -> io::Result<Option<(K, V)>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let mut lens = [0u8; 8];
        self.reader.read_exact(&mut lens)?;
        let klen = u32::from_le_bytes([lens[0], lens[1], lens[2], lens[3]]) as usize;
        let vlen = u32::from_le_bytes([lens[4], lens[5], lens[6], lens[7]]) as usize;

        let key: K = self.read_payload(klen)?;
        let value: V = self.read_payload(vlen)?;

        self.remaining -= 1;
        Ok(Some((key, value)))
    }

    fn read_payload<T: DeserializeOwned>(&mut self, len: usize) -> io::Result<T> {
        self.buf.resize(len, 0);
        self.reader.read_exact(&mut self.buf)?;
        serde_json::from_slice(&self.buf).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("run corrupto {}: {e}", self.path.display()),
            )
        })
    }
}

/* =========================
   Min-heap para el merge
   ========================= */

/// Cabeza actual de un run dentro del heap. El orden está invertido para
/// que `BinaryHeap` (max-heap) saque la clave más chica; a igual clave
/// sale primero el run de menor índice.
struct HeapItem<K, V> {
    key: K,
    value: V,
    run: usize,
}

impl<K: Ord, V> PartialEq for HeapItem<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, V> Eq for HeapItem<K, V> {}

impl<K: Ord, V> PartialOrd for HeapItem<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, V> Ord for HeapItem<K, V> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.run.cmp(&self.run))
    }
}
