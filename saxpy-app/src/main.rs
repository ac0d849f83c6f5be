#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    path::PathBuf,
    time::{Duration, Instant},
};

use clap::Parser;
use rcompute::{
    BufferDesc, ComputeKernel, DeviceBuffer, DeviceConfig, DeviceSelection,
    KernelConfig, KernelParams, log::VulkanLogLevel,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

const Y_INIT: f32 = 0.71;
const X_INIT: f32 = 0.65;
const TOLERANCE: f32 = 1e-5;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //Off never reaches a subscriber; map it to something valid
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliDevice {
    #[default]
    First,
    PreferDiscrete,
}

/// Run saxpy (y = a * x + y) on the GPU and check the result.
#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    #[arg(long, default_value = "first")]
    device: CliDevice,
    /// Pick the first device whose name contains this text; overrides
    /// --device.
    #[arg(long)]
    device_name: Option<String>,
    /// Compiled saxpy SPIR-V.
    #[arg(long, env = "RCOMPUTE_SAXPY_SPV", default_value = "out/shaders/saxpy.spv")]
    shader: PathBuf,
    #[arg(long, default_value_t = 90)]
    width: u32,
    #[arg(long, default_value_t = 60)]
    height: u32,
    #[arg(short = 'a', long, default_value_t = 2.0)]
    scalar: f32,
    /// Give up waiting on the GPU after this many milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Keep the buffers in host-visible memory instead of staging them.
    #[arg(long)]
    host_visible: bool,
}

impl CliArgs {
    fn kernel_config(&self) -> KernelConfig {
        let selection = match (&self.device_name, self.device) {
            (Some(name), _) => DeviceSelection::ByName(name.clone()),
            (None, CliDevice::First) => DeviceSelection::First,
            (None, CliDevice::PreferDiscrete) => DeviceSelection::PreferDiscrete,
        };
        KernelConfig {
            app_name: "saxpy-app".to_owned(),
            shader_path: self.shader.clone(),
            validation: self.graphics_debug_level.map(Into::into),
            device: DeviceConfig {
                selection,
                wait_timeout: self.timeout_ms.map(Duration::from_millis),
            },
        }
    }
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "rcompute", "saxpy-app");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let log_file_path = log_dir.join("log-file.txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.tracing_log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }

    tracing::debug!("cli_args: {cli_args:#?}");

    //SAFETY: Loads vulkan via libloading, same as any Vulkan program
    let mut kernel = unsafe { ComputeKernel::from_config(&cli_args.kernel_config()) }?;
    let device = kernel.device().clone();
    println!("Device: {}", device.name());

    let len = usize::try_from(u64::from(cli_args.width) * u64::from(cli_args.height))?;
    let desc = if cli_args.host_visible {
        BufferDesc::host_visible()
    } else {
        BufferDesc::default()
    };

    let mut y = DeviceBuffer::from_host(&device, &vec![Y_INIT; len], desc.with_name("y"))?;
    let x = DeviceBuffer::from_host(&device, &vec![X_INIT; len], desc.with_name("x"))?;
    tracing::info!(
        "Buffers in {:?} memory (usage {:?})",
        y.memory_properties(),
        y.usage()
    );

    let params = KernelParams::new(cli_args.width, cli_args.height, cli_args.scalar);
    let start = Instant::now();
    kernel.dispatch(&mut y, &x, params)?;
    let elapsed = start.elapsed();

    let result = y.to_vec()?;
    let expected = cli_args.scalar * X_INIT + Y_INIT;
    let mismatches = result
        .iter()
        .filter(|v| (*v - expected).abs() > TOLERANCE)
        .count();

    println!(
        "saxpy {}x{} a={} finished in {elapsed:?}; y[0] = {}",
        cli_args.width,
        cli_args.height,
        cli_args.scalar,
        result.first().copied().unwrap_or_default(),
    );

    if mismatches > 0 {
        eyre::bail!("{mismatches} of {len} elements differ from {expected}");
    }
    println!("All {len} elements equal {expected}");
    Ok(())
}
