use anyhow::{Context, Result};
use clap::Parser;
use common::{MetricsBackend, RequestDescriptor, DEFAULT_BLOCK_SIZE};
use std::{
    io::{self, Read},
    path::PathBuf,
};
use tracing::info;

/// Un proceso por job: lee un request, lo ejecuta y escribe el resultado
/// en bloques por stdout.
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Ejecuta un request de métricas y escribe el resultado por stdout")]
pub struct WorkerArgs {
    /// Request en JSON. Si no viene, se lee de stdin.
    #[arg(long, value_name = "JSON")]
    pub request: Option<String>,

    /// Directorio con users.csv, edits.csv y cohorts.csv
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: usize,
}

/// Devuelve `false` si el job tiene que salir con código de error.
pub fn run(args: WorkerArgs) -> Result<bool> {
    let raw = match args.request {
        Some(raw) => raw,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let descriptor: RequestDescriptor =
        serde_json::from_str(raw.trim()).context("request ilegible")?;

    let backend = MetricsBackend::open(&args.data_dir)
        .with_context(|| format!("no se pudo cargar el dataset de {}", args.data_dir.display()))?;

    info!(
        "worker {} ejecutando {} sobre '{}' (block_size={})",
        std::process::id(),
        descriptor.metric,
        descriptor.cohort_expr,
        args.block_size
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    Ok(common::worker::run(&descriptor, &backend, &mut out, args.block_size)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn argumentos_bien_definidos() {
        WorkerArgs::command().debug_assert();
    }

    #[test]
    fn request_por_argumento() {
        let args = WorkerArgs::try_parse_from([
            "worker",
            "--request",
            r#"{"cohort_expr":"42","metric":"edit_count"}"#,
            "--data-dir",
            "/tmp/datos",
            "--block-size",
            "128",
        ])
        .unwrap();

        assert_eq!(args.block_size, 128);
        assert_eq!(args.data_dir, PathBuf::from("/tmp/datos"));
        assert!(args.request.unwrap().contains("edit_count"));
    }
}
