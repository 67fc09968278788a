use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use trtinfer_gpu::{GpuContext, GpuContextConfig};
use trtinfer_trt::{EngineStore, Session, SessionConfig};

mod cli;

use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(true)
        .init();

    tracing::info!("trtinfer v{}", env!("CARGO_PKG_VERSION"));

    // Load or create config.
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(device) = cli.device {
        config.device = device;
    }

    match cli.command {
        Command::Build { session, json } => {
            session.apply(&mut config).map_err(anyhow::Error::msg)?;
            let gpu = GpuContext::new(config.gpu_config())?;
            let started = Instant::now();
            let session = Session::create(&gpu, config.session_options()?)?;
            tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "session created");
            cli::print_bindings(&session, json)?;
        }
        Command::Inspect { engine, json } => {
            let gpu = GpuContext::new(GpuContextConfig {
                device_ordinal: config.device,
            })?;
            let loaded = EngineStore::load(&engine)?
                .with_context(|| format!("cannot read engine {}", engine.display()))?;
            tracing::info!(bytes = loaded.plan_bytes, "engine plan read");
            let session = Session::from_engine(&gpu, loaded.engine, config.max_batch_size)?;
            cli::print_bindings(&session, json)?;
        }
        Command::Bench {
            session,
            iterations,
            warmup,
        } => {
            session.apply(&mut config).map_err(anyhow::Error::msg)?;
            let gpu = GpuContext::new(config.gpu_config())?;
            let mut session = Session::create(&gpu, config.session_options()?)?;
            bench(&mut session, iterations.max(1), warmup)?;
        }
    }

    Ok(())
}

fn bench(session: &mut Session, iterations: u32, warmup: u32) -> anyhow::Result<()> {
    let inputs: Vec<(usize, Vec<u8>)> = session
        .bindings()
        .iter()
        .filter(|b| b.is_input())
        .map(|b| (b.index, vec![0u8; b.size_bytes]))
        .collect();
    let outputs: Vec<usize> = session
        .bindings()
        .iter()
        .filter(|b| !b.is_input())
        .map(|b| b.index)
        .collect();
    let mut host_out: Vec<Vec<u8>> = vec![Vec::new(); outputs.len()];

    let mut run = |session: &mut Session| -> anyhow::Result<()> {
        for (index, data) in &inputs {
            session.copy_in(*index, data)?;
        }
        session.forward()?;
        for (index, out) in outputs.iter().zip(host_out.iter_mut()) {
            session.copy_out(*index, out)?;
        }
        Ok(())
    };

    for _ in 0..warmup {
        run(session)?;
    }

    let mut samples = Vec::with_capacity(iterations as usize);
    for _ in 0..iterations {
        let started = Instant::now();
        run(session)?;
        samples.push(started.elapsed().as_secs_f64() * 1000.0);
    }

    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(0.0, f64::max);
    tracing::info!(iterations, mean_ms = mean, min_ms = min, max_ms = max, "benchmark finished");
    println!(
        "{iterations} iterations, batch {}: mean {mean:.3} ms, min {min:.3} ms, max {max:.3} ms",
        session.batch_size()
    );
    Ok(())
}
