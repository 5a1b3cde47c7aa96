use std::{
    io,
    path::Path,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
    record::{Entry, Payload, SortKey},
    spill::{SpillRun, SpillStore},
};

struct BufferState<K, V> {
    entries: Vec<Entry<K, V>>,
    bytes: usize,
    spills: usize,
    store: SpillStore<K, V>,
}

/// Buffer acotado en memoria de una tarea map.
///
/// Cada `insert` suma el tamaño estimado de la entrada; cuando el total
/// alcanza `capacity * threshold` el contenido se manda al [`SpillStore`]
/// antes de devolver. Las mutaciones toman el lock de escritura y las
/// consultas de tamaño el de lectura.
pub struct BoundedBuffer<K, V> {
    capacity: usize,
    threshold: f64,
    state: RwLock<BufferState<K, V>>,
}

impl<K: SortKey, V: Payload> BoundedBuffer<K, V> {
    pub fn new(capacity: usize, threshold: f64, store: SpillStore<K, V>) -> Self {
        Self {
            capacity,
            threshold,
            state: RwLock::new(BufferState {
                entries: Vec::new(),
                bytes: 0,
                spills: 0,
                store,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BufferState<K, V>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BufferState<K, V>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn spill_limit(&self) -> f64 {
        self.capacity as f64 * self.threshold
    }

    /// Agrega una entrada; si se pasa del umbral hace spill en el acto.
    pub fn insert(&self, key: K, value: V) -> io::Result<()> {
        let entry = Entry::new(key, value);
        let mut state = self.write();

        state.bytes += entry.size();
        state.entries.push(entry);

        if state.bytes as f64 >= self.spill_limit() {
            Self::spill_locked(&mut state)?;
        }
        Ok(())
    }

    /// Saca todas las entradas en orden de llegada y deja el buffer vacío.
    pub fn drain_all(&self) -> Vec<Entry<K, V>> {
        let mut state = self.write();
        state.bytes = 0;
        std::mem::take(&mut state.entries)
    }

    /// Spill incondicional (si hay algo que volcar).
    pub fn force_flush(&self) -> io::Result<()> {
        let mut state = self.write();
        if state.entries.is_empty() {
            return Ok(());
        }
        Self::spill_locked(&mut state)
    }

    fn spill_locked(state: &mut BufferState<K, V>) -> io::Result<()> {
        let entries = std::mem::take(&mut state.entries);
        state.bytes = 0;
        state.store.spill(entries)?;
        state.spills += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn current_bytes(&self) -> usize {
        self.read().bytes
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn spill_count(&self) -> usize {
        self.read().spills
    }

    pub fn is_full(&self) -> bool {
        self.read().bytes >= self.capacity
    }

    /// Copia de los metadatos de los runs escritos hasta ahora.
    pub fn runs(&self) -> Vec<SpillRun> {
        self.read().store.runs().to_vec()
    }

    pub fn has_runs(&self) -> bool {
        !self.read().store.is_empty()
    }

    /// Merge k-way de los runs a `output`.
    pub fn merge_runs(&self, output: &Path) -> io::Result<u64> {
        self.read().store.merge_all(output)
    }

    pub fn remove_runs(&self) {
        self.write().store.remove_runs();
    }
}
