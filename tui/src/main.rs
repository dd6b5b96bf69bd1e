use clap::Parser;
use log::{error, info, warn, LevelFilter};

use tlmu_core::bus::Bus;
use tlmu_backend::harness::*;
use tlmu_backend::engine::BootState;
use tlmu_backend::registry::{BackendRegistry, SCRIPT_BACKEND};
use tlmu_backend::sync::{QuantumKeeper, DEFAULT_SYNC_PERIOD_NS};

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

/// Core run when none is given on the command line.
const DEFAULT_CORE: &str = "ARM:libtlmu-arm.so:arm1176:arm-guest/noname.elf";

#[derive(Parser, Debug)]
struct Args {
    /// Core to run, as NAME:BACKEND:CPU:IMAGE (may be repeated)
    #[clap(short, long = "core")]
    cores: Vec<CoreSpec>,
    /// How often engines yield to the harness, in ns of virtual time
    #[clap(long, default_value_t = DEFAULT_SYNC_PERIOD_NS)]
    sync_period_ns: u64,
    /// Instruction counting shift passed to engines
    #[clap(long, default_value_t = 1)]
    icount: u32,
    /// Boot cores in the sleeping state
    #[clap(long)]
    sleeping: bool,
    /// Ask engines to trace executed code
    #[clap(long)]
    trace: bool,
    /// Dump all memory regions into this directory when done
    #[clap(short, long)]
    dump: Option<PathBuf>,
    /// Log level (off, error, warn, info, debug, trace)
    #[clap(short, long, default_value = "info")]
    log_level: LevelFilter,
}

fn setup_logger(level: LevelFilter) -> anyhow::Result<()> {
    use fern::colors::{Color, ColoredLevelConfig};
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::BrightBlack);
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!("[{}][{}][{}] {}",
                colors.color(record.level()),
                std::thread::current().name().unwrap_or("?"),
                record.target(),
                message))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

/// Backends named by some core that the registry can't provide.
fn missing_backends<'a>(registry: &BackendRegistry, cores: &'a [CoreSpec]) -> Vec<&'a str> {
    let mut res: Vec<&str> = cores.iter()
        .map(|spec| spec.backend.as_str())
        .filter(|name| !registry.contains(name))
        .collect();
    res.dedup();
    res
}

fn dump_memory(bus: &Bus, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    bus.dump_memory(dir, "bin")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logger(args.log_level)?;

    // Every core is connected to a shared bus that maps:
    //
    //   0x2000_0000 io_ram (16 MiB)
    //   0x0000_0000 sdram  (1 MiB)
    let bus = match Bus::with_default_map() {
        Ok(val) => Arc::new(val),
        Err(reason) => {
            error!("Failed to construct emulator Bus: {reason}");
            process::exit(-1);
        }
    };

    // There's no way to stop a running core, so on Ctrl-C all we can do
    // is save what's in memory and leave.
    let int_bus = bus.clone();
    let int_dump = args.dump.clone();
    ctrlc::set_handler(move || {
        info!("Interrupted");
        if let Some(dir) = &int_dump {
            if let Err(reason) = dump_memory(&int_bus, dir) {
                error!("Memory dump failed: {reason:#}");
            }
        }
        int_bus.log_stats();
        process::exit(0);
    })?;

    let cfg = HarnessConfig {
        icount: args.icount,
        sync_period_ns: args.sync_period_ns,
        boot_state: if args.sleeping { BootState::Sleeping } else { BootState::Running },
        trace: args.trace,
        ..Default::default()
    };
    let keeper = Arc::new(QuantumKeeper::new(cfg.sync_period_ns));
    let registry = BackendRegistry::builtin();

    let cores = if args.cores.is_empty() {
        vec![DEFAULT_CORE.parse::<CoreSpec>()?]
    } else {
        args.cores
    };
    for name in missing_backends(&registry, &cores) {
        warn!("No backend named {name}; the built-in one is {SCRIPT_BACKEND} \
            (e.g. -c CPU0:{SCRIPT_BACKEND}:any:guest.txt)");
    }

    let mut harness = Harness::new(bus.clone(), registry, cfg)
        .with_sync(keeper.clone());
    for spec in cores {
        harness.add_core(spec);
    }

    let report = harness.run();
    info!("{} of {} cores ran to completion", report.halted(), report.outcomes.len());
    for (name, t) in keeper.snapshot() {
        info!("{name}: {}ns virtual time, {} syncs", t.elapsed_ns, t.syncs);
    }
    bus.log_stats();

    if let Some(dir) = &args.dump {
        dump_memory(&bus, dir)?;
    }
    process::exit(0);
}
