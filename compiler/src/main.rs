use clap::Parser;
use std::path::PathBuf;
use tracing::Level;

use hfc::config::{Architecture, GenOptions, OptionFlags, Target};
use hfc::diag::GenError;

#[derive(Parser, Debug)]
#[command(
    name = "hfc",
    version,
    about = "Hybrid Fortran code generator: renders annotated routines for CPU, OpenMP, OpenACC and CUDA Fortran"
)]
struct Cli {
    /// Input unit description (.json)
    unit: PathBuf,

    /// Target architecture
    #[arg(long, value_enum)]
    arch: Architecture,

    /// Emit runtime debug output around kernels
    #[arg(long)]
    debug: bool,

    /// Record host values and compare them on the device
    #[arg(long)]
    trace: bool,

    /// Device code runs in an emulator
    #[arg(long)]
    emulation: bool,

    /// Dump the values used in each kernel after it ran
    #[arg(long)]
    debug_print: bool,

    /// Wrap every rendered region in marker comments
    #[arg(long)]
    region_markers: bool,

    /// Leave the device cache configuration alone
    #[arg(long)]
    keep_cache_settings: bool,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log generation phases to stderr
    #[arg(long)]
    verbose: bool,
}

fn fail(error: &GenError) -> ! {
    eprintln!("hfc: {}", error);
    std::process::exit(if error.is_usage() { 1 } else { 2 });
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_target(false)
        .init();

    let target = Target {
        architecture: cli.arch,
        debug: cli.debug,
        trace: cli.trace,
        emulation: cli.emulation,
    };
    let options = GenOptions {
        region_markers: cli.region_markers,
        flags: OptionFlags {
            debug_print: cli.debug_print,
            keep_gpu_cache_settings: cli.keep_cache_settings,
        },
    };

    if cli.verbose {
        eprintln!("hfc: unit   = {}", cli.unit.display());
        eprintln!("hfc: target = {}", target);
    }

    // ── Read the unit description ──
    let text = match std::fs::read_to_string(&cli.unit) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("hfc: error: {}: {}", cli.unit.display(), e);
            std::process::exit(2);
        }
    };
    let unit = match hfc::model::UnitModel::from_json(&text) {
        Ok(u) => u,
        Err(e) => fail(&e),
    };

    if cli.verbose {
        let routines: usize = unit.modules.iter().map(|m| m.routines.len()).sum();
        eprintln!("hfc: {} modules, {} subroutines", unit.modules.len(), routines);
    }

    // ── Generate ──
    let generated = match hfc::pipeline::generate(&unit, &target, options) {
        Ok(g) => g,
        Err(e) => fail(&e),
    };

    // ── Write ──
    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &generated) {
                eprintln!("hfc: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
            if cli.verbose {
                eprintln!("hfc: wrote {} bytes to {}", generated.len(), path.display());
            }
        }
        None => print!("{}", generated),
    }
}
