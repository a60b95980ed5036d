//! CLI wiring for convforge.

use crate::config::LibraryConfig;
use crate::library::Library;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use convforge_autotune::{DbLayer, PerformanceDatabase};
use convforge_backend_gpu::{DeviceIdentity, WgpuDevice};
use convforge_problem::{ConvParams, DataType, Direction, OperatorKind, ProblemDescriptor, TensorShape};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "convforge", about = "Convolution solver and tuning database toolkit")]
pub struct Cli {
    /// JSON library configuration; flags below override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub system_db: Option<PathBuf>,

    #[arg(long, global = true)]
    pub user_db: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = false)]
    pub disable_asm: bool,

    #[arg(long, global = true, default_value_t = false)]
    pub disable_binaries: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DirectionArg {
    Forward,
    BackwardData,
    BackwardWeights,
}

impl From<DirectionArg> for Direction {
    fn from(value: DirectionArg) -> Direction {
        match value {
            DirectionArg::Forward => Direction::Forward,
            DirectionArg::BackwardData => Direction::BackwardData,
            DirectionArg::BackwardWeights => Direction::BackwardWeights,
        }
    }
}

/// A 2D convolution in x/w/y tensor terms.
#[derive(Args, Debug, Clone)]
pub struct ProblemArgs {
    #[arg(long, value_enum, default_value = "forward")]
    pub direction: DirectionArg,
    #[arg(long, default_value_t = 1)]
    pub batch: usize,
    #[arg(long)]
    pub in_channels: usize,
    #[arg(long)]
    pub height: usize,
    #[arg(long)]
    pub width: usize,
    #[arg(long)]
    pub out_channels: usize,
    #[arg(long, default_value_t = 3)]
    pub kernel: usize,
    #[arg(long, default_value_t = 0)]
    pub pad: usize,
    #[arg(long, default_value_t = 1)]
    pub stride: usize,
    #[arg(long, default_value_t = 1)]
    pub dilation: usize,
    #[arg(long, default_value_t = false)]
    pub bias: bool,
    /// Use the Winograd operator family instead of direct convolution.
    #[arg(long, default_value_t = false)]
    pub winograd: bool,
}

impl ProblemArgs {
    pub fn operator(&self) -> OperatorKind {
        if self.winograd {
            OperatorKind::WinogradConvolution
        } else {
            OperatorKind::DirectConvolution
        }
    }

    pub fn to_problem(&self) -> convforge_problem::Result<ProblemDescriptor> {
        let conv = ConvParams::new(
            (self.pad, self.pad),
            (self.stride, self.stride),
            (self.dilation, self.dilation),
        );
        let x = TensorShape::nchw(self.batch, self.in_channels, self.height, self.width, DataType::F32);
        let w = TensorShape::nchw(self.out_channels, self.in_channels, self.kernel, self.kernel, DataType::F32);
        let y = TensorShape::nchw(
            self.batch,
            self.out_channels,
            conv.output_height(self.height, self.kernel),
            conv.output_width(self.width, self.kernel),
            DataType::F32,
        );
        Ok(ProblemDescriptor::from_tensors(self.direction.into(), &x, &w, &y, conv)?.with_bias(self.bias))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the canonical key of a convolution problem.
    Key(ProblemArgs),
    /// Print the capabilities detected for the GPU adapter.
    Probe {
        #[arg(long, default_value_t = 0)]
        compute_units: usize,
    },
    /// List applicable solvers in priority order with their solutions.
    Solutions {
        #[command(flatten)]
        problem: ProblemArgs,
        #[arg(long, default_value_t = 0)]
        compute_units: usize,
    },
    /// Resolve a key through the user and shared databases of a device.
    DbLookup {
        #[arg(long)]
        key: String,
        #[arg(long)]
        device: String,
        #[arg(long)]
        compute_units: usize,
    },
}

impl Cli {
    /// File config first, then flag overrides.
    pub fn library_config(&self) -> Result<LibraryConfig> {
        let mut config = match &self.config {
            Some(path) => LibraryConfig::load(path)?,
            None => LibraryConfig::default(),
        };
        if let Some(dir) = &self.system_db {
            config.system_db_dir = dir.clone();
        }
        if let Some(dir) = &self.user_db {
            config.user_db_dir = dir.clone();
        }
        config.disable_asm_kernels |= self.disable_asm;
        config.disable_binaries |= self.disable_binaries;
        Ok(config)
    }
}

fn open_library(config: LibraryConfig, compute_units: usize) -> Result<Library> {
    let device = WgpuDevice::new()
        .context("opening GPU device")?
        .with_compute_units(compute_units);
    Ok(Library::new(config, Arc::new(device)))
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config = cli.library_config()?;

    match cli.command {
        Command::Key(problem) => {
            println!("{}", problem.to_problem()?.serialize()?);
        }
        Command::Probe { compute_units } => {
            let mut library = open_library(config, compute_units)?;
            let caps = library.capabilities();
            println!("device: {}", library.device().identity());
            println!("{}", serde_json::to_string_pretty(&caps)?);
            library.shutdown()?;
        }
        Command::Solutions { problem, compute_units } => {
            let mut library = open_library(config, compute_units)?;
            let ctx = library.context(problem.to_problem()?, problem.operator())?;
            let key = ctx.problem_key()?;
            info!(%key, "listing solutions");

            println!("key: {key}");
            for solution in library.find_all_solutions(&ctx)? {
                println!(
                    "- {solution}: kernels={} workspace={}",
                    solution.kernels.len(),
                    solution.workspace_bytes
                );
                for kernel in &solution.kernels {
                    println!("    {} :: {}", kernel.source_id, kernel.entry_point);
                }
            }
            library.shutdown()?;
        }
        Command::DbLookup {
            key,
            device,
            compute_units,
        } => {
            let db = PerformanceDatabase::new(config.db_paths());
            let identity = DeviceIdentity::new(device, compute_units);
            match db.find_with_layer(&identity, &key) {
                Some((blob, layer)) => {
                    let layer = match layer {
                        DbLayer::User => "user",
                        DbLayer::Shared => "shared",
                    };
                    println!("{blob} ({layer})");
                }
                None => println!("not found"),
            }
        }
    }

    Ok(())
}
