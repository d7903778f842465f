// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Writes a short synthetic stream.
//!
//! Every rank runs as a task in this process, joined by a [`LocalGroup`].
//! Each step carries the step number, the simulated time and a 1-D field
//! split across the ranks.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dynamo_staging::{
    LocalGroup, Params, ProcessGroup, StagingWriter, StepMode, VariableDescriptor, logging,
    transport::OpenMode,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "staging-demo", about = "Publish a synthetic stream through the staging writer")]
struct Cli {
    /// Stream name
    #[arg(long, default_value = "demo")]
    name: String,

    /// Number of steps to write
    #[arg(long, default_value_t = 3)]
    steps: u64,

    /// Number of ranks, each run as a task in this process
    #[arg(long, default_value_t = 1)]
    ranks: usize,

    /// Field elements written by each rank per step
    #[arg(long, default_value_t = 8)]
    elements: u64,

    /// Transport library
    #[arg(long, default_value = "zmq")]
    library: String,

    /// Engine verbosity, 0-5
    #[arg(long, default_value_t = 3)]
    verbose: u8,

    /// Base port; rank ports are derived from it
    #[arg(long, env = "DYN_STAGING_BASE_PORT")]
    base_port: Option<u16>,

    /// Bind this address instead of the first usable interface
    #[arg(long, conflicts_with = "interface")]
    ip: Option<IpAddr>,

    /// Bind the address of this named interface
    #[arg(long)]
    interface: Option<String>,

    /// Where rank 0 writes its address for readers
    #[arg(long)]
    handshake_file: Option<PathBuf>,
}

impl Cli {
    fn params(&self) -> Params {
        let mut params = Params::from([
            ("verbose", self.verbose.to_string()),
            ("Library", self.library.clone()),
        ]);
        if let Some(port) = self.base_port {
            params.insert("BasePort", port.to_string());
        }
        if let Some(ip) = self.ip {
            params.insert("IPAddress", ip.to_string());
        }
        if let Some(interface) = &self.interface {
            params.insert("NetworkInterface", interface.as_str());
        }
        if let Some(path) = &self.handshake_file {
            params.insert("HandshakeFile", path.display().to_string());
        }
        params
    }
}

async fn run_rank(cli: Arc<Cli>, group: LocalGroup) -> Result<()> {
    let rank = group.rank();
    let ranks = group.size() as u64;
    let mut writer = StagingWriter::builder(&cli.name)
        .group(Arc::new(group))
        .build()
        .context("failed to build writer")?;
    writer
        .open(&cli.params(), OpenMode::Write)
        .await
        .with_context(|| format!("rank {rank} failed to open stream '{}'", cli.name))?;

    let step_number = VariableDescriptor::global_value::<u64>("step")?;
    let time = VariableDescriptor::global_value::<f64>("time")?;
    let field = VariableDescriptor::global_array::<f64>(
        "field",
        vec![cli.elements * ranks],
        vec![cli.elements * rank as u64],
        vec![cli.elements],
    )?;

    for _ in 0..cli.steps {
        writer.begin_step(StepMode::Append, None)?;
        let step = writer.current_step().context("step not started")?;
        if rank == 0 {
            writer.put_value(&step_number, &step)?;
            writer.put_value(&time, &(step as f64 * 0.1))?;
        }
        let values: Vec<f64> = (0..cli.elements)
            .map(|i| (step * 1000 + rank as u64 * cli.elements + i) as f64)
            .collect();
        writer.put_deferred(&field, &values)?;
        writer
            .end_step()
            .await
            .with_context(|| format!("rank {rank} failed to end step {step}"))?;
    }

    if let (Some(endpoint), Some(last)) = (writer.endpoint().cloned(), writer.current_step()) {
        let pack = writer.pull(&endpoint, last).await?;
        tracing::info!(rank, %endpoint, step = last, bytes = pack.len(), "Pulled own data pack");
    }

    writer.close(None).await.context("failed to close writer")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Arc::new(Cli::parse());
    tracing::info!(
        name = %cli.name,
        steps = cli.steps,
        ranks = cli.ranks,
        library = %cli.library,
        "Starting staging demo"
    );

    let groups = LocalGroup::new(cli.ranks).context("invalid rank count")?;
    let tasks: Vec<_> = groups
        .into_iter()
        .map(|group| tokio::spawn(run_rank(cli.clone(), group)))
        .collect();

    let mut failed = 0;
    for task in tasks {
        if let Err(e) = task.await.context("rank task panicked")? {
            tracing::error!(error = %format!("{e:#}"), "Rank failed");
            failed += 1;
        }
    }
    anyhow::ensure!(failed == 0, "{failed} of {} ranks failed", cli.ranks);
    Ok(())
}
