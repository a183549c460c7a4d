//! Lifecycle bus demo - main entry point.
//!
//! Wires a bus to the real process hooks, logs every category, and ticks
//! until something ends it:
//! - Ctrl-C / SIGTERM: terminate handlers, then finish (or hold with `--hold`)
//! - `--quit-after N`: an explicit quit on tick N
//! - `--panic-after N`: an uncaught panic on tick N

use clap::Parser;
use lifecycle_bus::{quit, BusConfig, Category, Event, EventBus, Handler, Scoped};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Process lifecycle event bus demo.
#[derive(Parser, Debug)]
#[command(name = "lifecycle-demo", version, about)]
struct Cli {
    /// JSON config file (environment overrides still apply)
    #[arg(long, env = "LIFECYCLE_CONFIG")]
    config: Option<PathBuf>,

    /// Keep running after terminate and quit handlers instead of exiting
    #[arg(long)]
    hold: bool,

    /// Do not run the previously installed panic hook after crash handlers
    #[arg(long)]
    no_chain: bool,

    /// Quit on this tick
    #[arg(long)]
    quit_after: Option<u64>,

    /// Exit code used by --quit-after
    #[arg(long, default_value_t = 0)]
    code: i32,

    /// Panic on this tick
    #[arg(long)]
    panic_after: Option<u64>,

    /// Milliseconds between ticks
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,
}

fn load_config(cli: &Cli) -> lifecycle_bus::Result<BusConfig> {
    let config = match &cli.config {
        Some(path) => BusConfig::load(path)?,
        None => BusConfig::default(),
    };
    let mut config = config.from_env()?;
    if cli.hold {
        config = config
            .with_exit_on_terminate(false)
            .with_exit_after_quit_handlers(false);
    }
    if cli.no_chain {
        config = config.with_call_previous_exception_handler(false);
    }
    Ok(config)
}

fn log_handler(category: Category) -> Handler {
    Handler::named(format!("demo-{category}"), move |event: &Event| {
        tracing::info!(
            "demo_handler: category={}, event={}, exit_code={:?}",
            category,
            event.kind(),
            event.exit_code()
        );
    })
}

#[allow(clippy::panic)]
fn tick_loop(cli: &Cli) {
    let mut tick = 0u64;
    loop {
        lifecycle_bus::dispatch_pending();
        tick += 1;
        if cli.quit_after == Some(tick) {
            tracing::info!("demo_quit: tick={}, code={}", tick, cli.code);
            quit(cli.code);
        }
        if cli.panic_after == Some(tick) {
            panic!("demo panic on tick {tick}");
        }
        std::thread::sleep(Duration::from_millis(cli.tick_ms));
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    lifecycle_bus::observability::init_tracing();

    let config = load_config(&cli)?;
    tracing::info!("demo_starting: config={}", serde_json::to_string(&config)?);

    let bus = EventBus::new(config);
    for category in Category::ALL {
        bus.register(category, log_handler(category));
    }

    loop {
        match bus.run(|| tick_loop(&cli))? {
            Scoped::Completed(()) => return Ok(ExitCode::SUCCESS),
            Scoped::Held(held) => {
                tracing::info!("demo_quit_held: code={}, continuing", held.code());
            }
            Scoped::Exiting(exiting) => return Ok(exiting.into()),
        }
    }
}
