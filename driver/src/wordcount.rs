use std::sync::Arc;

use anyhow::{bail, Result};
use engine::{Datum, MapContext, Mapper, MapperFactory, ReduceContext, Reducer, ReducerFactory};

/// Normaliza una línea: minúsculas, y todo lo que no sea alfanumérico
/// ASCII o espacio pasa a ser un espacio.
pub fn normalize(line: &str) -> String {
    line.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect()
}

pub struct WordCountMapper;

impl Mapper<String, i64> for WordCountMapper {
    fn map(&mut self, _position: u64, line: &str, ctx: &mut MapContext<'_, String, i64>) -> Result<()> {
        for word in normalize(line).split_whitespace() {
            ctx.emit(word.to_string(), 1)?;
        }
        Ok(())
    }
}

/// Suma los valores enteros de cada palabra; los valores de texto se ignoran.
pub struct SumReducer;

impl Reducer for SumReducer {
    fn reduce(&mut self, key: &str, values: &[Datum], ctx: &mut ReduceContext<'_>) -> Result<()> {
        let total: i64 = values.iter().filter_map(Datum::as_int).sum();
        ctx.emit(key, &total)
    }
}

/// Jobs que conoce el driver, por nombre.
pub const JOBS: &[&str] = &["wordcount"];

pub fn job_factories(name: &str) -> Result<(MapperFactory<String, i64>, ReducerFactory)> {
    match name {
        "wordcount" => Ok((
            Arc::new(|| Box::new(WordCountMapper) as Box<dyn Mapper<String, i64>>),
            Arc::new(|| Box::new(SumReducer) as Box<dyn Reducer>),
        )),
        other => bail!("job desconocido: {other} (disponibles: {})", JOBS.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_limpia_signos_y_mayusculas() {
        assert_eq!(normalize("Hola, MUNDO!!"), "hola  mundo  ");
        assert_eq!(normalize("año-2024_x"), "a o 2024 x");
        let words: Vec<String> = normalize("It's a dog's life.")
            .split_whitespace()
            .map(str::to_string)
            .collect();
        assert_eq!(words, vec!["it", "s", "a", "dog", "s", "life"]);
    }

    #[test]
    fn job_desconocido_es_error() {
        assert!(job_factories("wordcount").is_ok());
        let err = job_factories("join").err().unwrap();
        assert!(err.to_string().contains("job desconocido"));
    }
}
