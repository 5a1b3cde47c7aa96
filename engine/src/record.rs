use std::fmt::{self, Display};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Overhead fijo estimado por entrada (cabeceras de objeto, referencias).
pub const ENTRY_OVERHEAD: usize = 32;

/// Estimación de memoria de un payload, en bytes.
/// No pretende ser exacta: sólo decide cuándo hacer spill.
pub trait EstimateSize {
    fn estimated_size(&self) -> usize;
}

impl EstimateSize for String {
    fn estimated_size(&self) -> usize {
        self.chars().count() * 2
    }
}

impl EstimateSize for str {
    fn estimated_size(&self) -> usize {
        self.chars().count() * 2
    }
}

macro_rules! fixed_width {
    ($width:expr => $($t:ty),*) => {
        $(
            impl EstimateSize for $t {
                fn estimated_size(&self) -> usize {
                    $width
                }
            }
        )*
    };
}

fixed_width!(8 => i64, u64, f64, isize, usize);
fixed_width!(4 => i32, u32, f32);

/// Todo lo que puede viajar como clave o valor de una entrada:
/// se imprime en los archivos de texto, se serializa en los runs
/// y tiene una estimación de tamaño.
pub trait Payload:
    Display + Serialize + DeserializeOwned + EstimateSize + Send + Sync + 'static
{
}

impl<T> Payload for T where
    T: Display + Serialize + DeserializeOwned + EstimateSize + Send + Sync + 'static
{
}

/// Claves: payloads con orden total.
pub trait SortKey: Payload + Ord {}

impl<T> SortKey for T where T: Payload + Ord {}

/// Redondea hacia arriba al múltiplo de 8 más cercano.
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Tamaño estimado de una entrada completa.
pub fn estimate_entry_size<K, V>(key: &K, value: &V) -> usize
where
    K: EstimateSize + ?Sized,
    V: EstimateSize + ?Sized,
{
    align8(ENTRY_OVERHEAD + key.estimated_size() + value.estimated_size())
}

/// Par clave/valor inmutable con su tamaño estimado ya calculado.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<K, V> {
    key: K,
    value: V,
    size: usize,
}

impl<K: EstimateSize, V: EstimateSize> Entry<K, V> {
    pub fn new(key: K, value: V) -> Self {
        let size = estimate_entry_size(&key, &value);
        Self { key, value, size }
    }
}

impl<K, V> Entry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }
}

/// Valor del lado reduce: lo que se lee de un archivo intermedio.
/// Si el texto parsea como entero se guarda como `Int`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Int(i64),
    Text(String),
}

impl Datum {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(n) => Datum::Int(n),
            Err(_) => Datum::Text(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Datum::Int(n) => Some(*n),
            Datum::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Datum::Int(_) => None,
            Datum::Text(s) => Some(s),
        }
    }
}

impl Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Int(n) => write!(f, "{n}"),
            Datum::Text(s) => f.write_str(s),
        }
    }
}

impl EstimateSize for Datum {
    fn estimated_size(&self) -> usize {
        match self {
            Datum::Int(n) => n.estimated_size(),
            Datum::Text(s) => s.estimated_size(),
        }
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Int(n)
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::Text(s)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::Text(s.to_string())
    }
}
