mod signals;

use ahyve_core::{
    KernelFormat, LaunchParameters, LifecycleController, LifecycleOutcome, NetworkMode,
};
use clap::Parser;
use signals::HostSignals;
use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status for anything that goes wrong before the guest is handed off.
const EXIT_SETUP_FAILED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "ahyve")]
#[command(about = "Boot a kernel in a lightweight VM with its console on this terminal")]
struct Cli {
    /// Number of guest vCPUs
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    cpus: u32,

    /// Memory size (MiB)
    #[arg(
        short,
        long = "mem",
        default_value_t = 512,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    memory: u64,

    /// Writable disk image file path
    #[arg(short, long, default_value = "")]
    disk: String,

    /// Network (use n/no to disable network of the VM)
    #[arg(short, long = "net", default_value = "nat")]
    network: NetworkMode,

    /// Kernel file path
    #[arg(short, long)]
    kernel: PathBuf,

    /// Kernel image format (detected from the image when omitted)
    #[arg(long)]
    kernel_format: Option<KernelFormat>,

    /// Initrd file path
    #[arg(short, long)]
    initrd: Option<PathBuf>,

    /// Kernel cmdline
    #[arg(long)]
    cmdline: Option<String>,
}

impl Cli {
    fn launch_parameters(&self) -> LaunchParameters {
        LaunchParameters {
            cpus: self.cpus,
            memory_mib: self.memory,
            disk: Some(PathBuf::from(&self.disk)),
            network: self.network,
            kernel: self.kernel.clone(),
            kernel_format: self.kernel_format,
            initrd: self.initrd.clone(),
            cmdline: self.cmdline.clone(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Logs go to stderr, stdout belongs to the guest console.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = launch(cli).await;
    report(&result);
    ExitCode::from(exit_code_for(&result))
}

/// Runs the guest. An `Err` means it was never handed to the hypervisor.
/// The terminal is restored before this returns.
async fn launch(cli: Cli) -> Result<LifecycleOutcome, String> {
    let signals = HostSignals::install().map_err(setup_error)?;
    let hypervisor = ahyve_shim::default_hypervisor().map_err(setup_error)?;
    let constraints = hypervisor.constraints();

    let stdin = std::io::stdin();
    if !ahyve_shim::is_tty(&stdin) {
        return Err("stdin is not a terminal".to_string());
    }
    let (terminal, console) =
        ahyve_shim::prepare_console(stdin, std::io::stdout()).map_err(setup_error)?;

    let params = cli.launch_parameters();
    let spec = match ahyve_core::build(&params, console, &constraints) {
        Ok(spec) => spec,
        Err(e) => {
            drop(terminal);
            return Err(setup_error(e));
        }
    };

    match serde_json::to_string(&spec) {
        Ok(json) => tracing::debug!(spec = %json, "machine description"),
        Err(e) => tracing::debug!(error = %e, "cannot serialize machine description"),
    }

    let mut controller = LifecycleController::new(hypervisor.as_ref());
    let outcome = controller.run(spec, signals.recv()).await;

    drop(terminal);
    Ok(outcome)
}

fn setup_error(error: impl Display) -> String {
    error.to_string()
}

fn report(result: &Result<LifecycleOutcome, String>) {
    match result {
        Ok(LifecycleOutcome::Stopped) => tracing::debug!("guest stopped"),
        Ok(outcome) => eprintln!("ahyve: {}", outcome),
        Err(message) => eprintln!("ahyve: {}", message),
    }
}

fn exit_code_for(result: &Result<LifecycleOutcome, String>) -> u8 {
    match result {
        Ok(outcome) => outcome.exit_code(),
        Err(_) => EXIT_SETUP_FAILED,
    }
}
