//! Generador de textos de prueba para los jobs: archivos aleatorios,
//! archivos con frecuencias de palabras conocidas y lotes de varios archivos.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tracing::info;

const SAMPLE_WORDS: &[&str] = &[
    "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "hello", "world", "rust",
    "programming", "mapreduce", "framework", "big", "data", "processing", "distributed",
    "computing", "algorithm", "software", "development", "university", "student", "project",
    "implementation", "multithreading", "parallel", "execution", "performance",
];

const SAMPLE_SENTENCES: &[&str] = &[
    "The quick brown fox jumps over the lazy dog.",
    "Hello world from Rust programming.",
    "MapReduce is a powerful framework for big data processing.",
    "Distributed computing enables parallel execution of algorithms.",
    "Software development requires careful implementation and testing.",
    "University students work on challenging programming projects.",
    "Multithreading improves application performance significantly.",
    "Big data analytics helps organizations make better decisions.",
    "Rust provides excellent support for concurrent programming.",
    "Framework design patterns simplify software architecture.",
];

const PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':'];

/// Frecuencias del archivo `frequency_test.txt` de los datos por defecto.
pub const DEFAULT_FREQUENCIES: &[(&str, usize)] = &[
    ("hello", 10),
    ("world", 8),
    ("rust", 15),
    ("mapreduce", 5),
    ("test", 12),
];

pub struct Generator {
    rng: StdRng,
}

impl Generator {
    /// Con semilla la salida es reproducible.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Una línea: oración de ejemplo, palabras sueltas o mezcla con puntuación.
    pub fn random_line(&mut self) -> String {
        match self.rng.gen_range(0..3) {
            0 => SAMPLE_SENTENCES[self.rng.gen_range(0..SAMPLE_SENTENCES.len())].to_string(),
            1 => {
                let n = self.rng.gen_range(3..=10);
                self.random_words(n)
            }
            _ => self.mixed_line(),
        }
    }

    fn random_words(&mut self, count: usize) -> String {
        (0..count)
            .map(|_| SAMPLE_WORDS[self.rng.gen_range(0..SAMPLE_WORDS.len())])
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn mixed_line(&mut self) -> String {
        let n = self.rng.gen_range(2..=6);
        let mut line = self.random_words(n);
        if self.rng.gen_bool(0.5) {
            line.push(PUNCTUATION[self.rng.gen_range(0..PUNCTUATION.len())]);
        }
        if self.rng.gen_bool(0.5) {
            let n = self.rng.gen_range(1..=4);
            line.push(' ');
            line.push_str(&self.random_words(n));
        }
        line
    }

    /// Escribe `lines` líneas aleatorias en `path`.
    pub fn text_file(&mut self, path: &Path, lines: usize) -> Result<()> {
        let mut w = create(path)?;
        for _ in 0..lines {
            writeln!(w, "{}", self.random_line())?;
        }
        w.flush()?;
        info!("generado {} con {} líneas", path.display(), lines);
        Ok(())
    }

    /// `test001.txt`, `test002.txt`, ... con `lines_per_file` líneas cada uno.
    pub fn multiple_files(&mut self, dir: &Path, files: usize, lines_per_file: usize) -> Result<Vec<PathBuf>> {
        let mut out = Vec::with_capacity(files);
        for i in 1..=files {
            let path = dir.join(format!("test{i:03}.txt"));
            self.text_file(&path, lines_per_file)?;
            out.push(path);
        }
        Ok(out)
    }

    /// Cada palabra aparece exactamente tantas veces como indica el mapa,
    /// en orden aleatorio y con 5 a 14 palabras por línea.
    pub fn frequency_file(&mut self, path: &Path, frequencies: &BTreeMap<String, usize>) -> Result<()> {
        let mut words: Vec<&str> = frequencies
            .iter()
            .flat_map(|(w, n)| std::iter::repeat(w.as_str()).take(*n))
            .collect();
        words.shuffle(&mut self.rng);

        let mut w = create(path)?;
        for chunk in chunk_randomly(&words, &mut self.rng) {
            writeln!(w, "{}", chunk.join(" "))?;
        }
        w.flush()?;
        info!("generado {} con {} palabras", path.display(), words.len());
        Ok(())
    }

    /// Datos por defecto: `test.txt` (100 líneas), `frequency_test.txt` y
    /// tres archivos de 50 líneas.
    pub fn default_data(&mut self, dir: &Path) -> Result<()> {
        self.text_file(&dir.join("test.txt"), 100)?;
        let freqs = DEFAULT_FREQUENCIES
            .iter()
            .map(|(w, n)| (w.to_string(), *n))
            .collect();
        self.frequency_file(&dir.join("frequency_test.txt"), &freqs)?;
        self.multiple_files(dir, 3, 50)?;
        Ok(())
    }
}

fn chunk_randomly<'a>(words: &'a [&'a str], rng: &mut StdRng) -> Vec<&'a [&'a str]> {
    let mut out = Vec::new();
    let mut rest = words;
    while !rest.is_empty() {
        let n = rng.gen_range(5..=14).min(rest.len());
        let (head, tail) = rest.split_at(n);
        out.push(head);
        rest = tail;
    }
    out
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path).with_context(|| format!("no se pudo crear {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Parsea `palabra=cantidad`.
pub fn parse_frequency(raw: &str) -> Result<(String, usize)> {
    let Some((word, count)) = raw.split_once('=') else {
        bail!("frecuencia inválida {raw:?}, se espera palabra=cantidad");
    };
    let word = word.trim();
    if word.is_empty() || word.contains(char::is_whitespace) {
        bail!("palabra inválida en {raw:?}");
    }
    let count = count
        .trim()
        .parse::<usize>()
        .with_context(|| format!("cantidad inválida en {raw:?}"))?;
    Ok((word.to_string(), count))
}
