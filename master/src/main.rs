use anyhow::Result;
use clap::Parser;
use common::{MetricsBackend, RequestDescriptor};
use master::{
    controller::JobSubmitter, CliArgs, EngineContext, InlineLauncher, LaunchMode, MasterConfig,
    ProcessLauncher, WorkerLauncher,
};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    signal,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout lleva las respuestas: los logs van a stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,common=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = MasterConfig::try_from(CliArgs::parse())?;

    let launcher: Arc<dyn WorkerLauncher> = match &config.launch {
        LaunchMode::Process {
            worker_bin,
            data_dir,
        } => {
            info!("workers como procesos: {}", worker_bin.display());
            Arc::new(ProcessLauncher {
                worker_bin: worker_bin.clone(),
                data_dir: data_dir.clone(),
                block_size: config.controller.block_size,
            })
        }
        LaunchMode::Inline { data_dir } => {
            info!("workers en proceso con datos de {}", data_dir.display());
            Arc::new(InlineLauncher {
                backend: MetricsBackend::open(data_dir)?,
                block_size: config.controller.block_size,
            })
        }
    };

    let (ctx, mut responses) = EngineContext::start(config.controller.clone(), launcher);

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = responses.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let shutdown = ctx.shutdown_token();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C recibido, deteniendo el motor");
                shutdown.cancel();
            }
        })
    };

    tokio::select! {
        res = read_requests(ctx.submitter()) => {
            res?;
            info!("fin de la entrada, esperando los jobs admitidos");
        }
        _ = shutdown.cancelled() => {}
    }

    ctx.drain().await;
    ctrl_c.abort();
    printer.await??;

    info!("master terminado");
    Ok(())
}

/// Un request JSON por línea. Las líneas ilegibles se saltean.
async fn read_requests(submitter: JobSubmitter) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<RequestDescriptor>(line) {
            Ok(request) => match submitter.submit(request) {
                Ok(job_id) => debug!("job {} encolado", job_id),
                Err(e) => warn!("request rechazado: {}", e),
            },
            Err(e) => warn!("línea ignorada, no es un request: {}", e),
        }
    }
    Ok(())
}
