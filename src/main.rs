// main.rs
// Description: Binary entry point. Reads a run configuration and an already imputed series file
//              (both JSON), then runs one training session. Ctrl-C stops training before the
//              next batch and leaves an interrupt checkpoint.
// History:
// - 2026-02-01: Add entry point and checkpoint save and load.
// - 2026-10-16: Replace menu loop with a single configured training session.
// Author: Marcus Schlieper

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use latent_ode_trainer::{Result, SeriesTensor, Session, TrainConfig, TrainOutcome};

#[derive(Debug, Parser)]
#[command(name = "latent-ode-trainer", about = "Train a latent ODE model on scalar time series")]
struct Args {
    /// Run configuration (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Training series (JSON: {"v_values": [[...], ...], "opt_times": [[...], ...]}).
    #[arg(long)]
    data: PathBuf,

    /// Series evaluated with the monitoring loss after training.
    #[arg(long)]
    eval_data: Option<PathBuf>,
}

fn run(args: &Args) -> Result<()> {
    let cfg = match &args.config {
        Some(p_path) => TrainConfig::from_json_file(p_path)?,
        None => TrainConfig::default(),
    };
    let series = SeriesTensor::from_json_file(&args.data)?;
    let opt_eval = match &args.eval_data {
        Some(p_path) => Some(SeriesTensor::from_json_file(p_path)?),
        None => None,
    };

    let session = Session::new(cfg)?;
    session.install_ctrlc_handler()?;
    let result = session.run(&series, opt_eval.as_ref())?;

    match &result.outcome {
        TrainOutcome::Done { i_epoch_idx, .. } => info!(i_epoch_idx, "trained"),
        TrainOutcome::Interrupted { i_epoch_idx, v_partial_losses, .. } => info!(
            i_epoch_idx,
            i_partial_batches = v_partial_losses.len(),
            "stopped by interrupt"
        ),
    }
    if let Some(p_saved) = &result.opt_saved {
        info!(s_path = %p_saved.display(), "checkpoint written");
    }
    if let Some(eval) = &result.opt_eval {
        info!(d_mean_smape = eval.d_mean, d_median_smape = eval.d_median, "evaluation");
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "latent_ode_trainer=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "training session failed");
            ExitCode::FAILURE
        }
    }
}
