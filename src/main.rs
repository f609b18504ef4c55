#[macro_use]
extern crate log;
#[macro_use]
extern crate trackable;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::tensor::{Distribution, Int, Tensor};
use clap::{Parser, Subcommand};
use slimnas::{BaseNet, Calibration, DeviceSlot, MultinomialPolicy, SearchConfig, SearchRegime};
use std::path::PathBuf;
use trackable::result::MainResult;
use tracing_subscriber::EnvFilter;

type Backend = NdArray;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Opt {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Builds the model and prints its layers and baseline FLOPs.
    Describe {
        #[arg(long)]
        config: PathBuf,
    },

    /// Runs an alphas search over randomly generated batches.
    Search {
        #[arg(long)]
        config: PathBuf,

        #[arg(long, default_value_t = 1)]
        epochs: usize,

        #[arg(long, default_value_t = 4)]
        steps: usize,

        #[arg(long, default_value_t = 8)]
        batch_size: usize,
    },
}

fn main() -> MainResult {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let opt = Opt::parse();
    match opt.command {
        Command::Describe { config } => {
            let config = track!(SearchConfig::from_file(config))?;
            let model = track!(BaseNet::<Backend>::new(config.model, &NdArrayDevice::Cpu))?;
            println!("{}", model.config().registry_key());
            for &id in model.counter_layers() {
                println!("  [{}] {}", id, model.layers()[id]);
            }
            println!("partition_blocks: {:?}", model.partition_blocks());
            println!("baseline_flops: {:?}", model.baseline_flops());
            println!("paths: {}", model.n_combinations());
        }
        Command::Search {
            config,
            epochs,
            steps,
            batch_size,
        } => {
            let config = track!(SearchConfig::from_file(config))?;
            let calibration = track!(Calibration::from_file(&config.calibration))?;
            let device = NdArrayDevice::Cpu;
            let slots = config
                .devices
                .iter()
                .map(|&id| DeviceSlot::<Backend>::new(id, device))
                .collect();

            let n_classes = config.model.dataset.n_classes();
            let size = config.model.effective_input_size();
            let batches = (0..steps)
                .map(|_| {
                    let input = Tensor::<Backend, 4>::random(
                        [batch_size, 3, size, size],
                        Distribution::Default,
                        &device,
                    );
                    let target = Tensor::<Backend, 1, Int>::random(
                        [batch_size],
                        Distribution::Uniform(0.0, n_classes as f64),
                        &device,
                    );
                    (input, target)
                })
                .collect::<Vec<_>>();

            let mut regime = track!(SearchRegime::new(
                config,
                &calibration,
                slots,
                MultinomialPolicy
            ))?;
            let summaries = track!(regime.search(epochs, &batches))?;
            for s in summaries {
                info!(
                    "epoch={}, partition={:?}, flops_ratio={:.3}",
                    s.epoch, s.partition, s.partition_flops_ratio
                );
            }
        }
    }
    Ok(())
}
