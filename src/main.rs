use anyhow::{Context, Result};
use cloudsweep::{
    cli::{CommandLineArgs, GlobalArgs},
    modules::{run_module, ModuleId, Providers},
    pipeline::Shutdown,
    util::Counted,
};
use tokio::runtime::Builder;
use tracing::{info, warn};
use tracing_core::metadata::LevelFilter;
use tracing_subscriber::{
    self, fmt, prelude::__tracing_subscriber_SubscriberExt, registry, util::SubscriberInitExt,
};

fn main() -> anyhow::Result<()> {
    let args = CommandLineArgs::parse_args();

    let runtime = Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn setup_logging(global_args: &GlobalArgs) {
    let level = global_args.log_level();
    let filter = if global_args.verbose > 2 {
        // `-vvv` also traces the SDK and HTTP crates
        tracing_subscriber::filter::Targets::new().with_default(LevelFilter::TRACE)
    } else {
        tracing_subscriber::filter::Targets::new()
            .with_default(LevelFilter::ERROR)
            .with_target("cloudsweep", level)
    };
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .without_time();
    registry().with(fmt_layer).with(filter).init();
}

fn print_modules() {
    for id in ModuleId::all() {
        println!("{id}\n    {}", id.description());
        for spec in id.options() {
            let required = if spec.required { " (required)" } else { "" };
            if spec.default.is_empty() {
                println!("    --{}{required}: {}", spec.name, spec.description);
            } else {
                println!("    --{}{required}: {} [default: {}]", spec.name, spec.description, spec.default);
            }
        }
        println!();
    }
}

async fn async_main(args: CommandLineArgs) -> Result<()> {
    setup_logging(&args.global_args);

    let Some((id, options)) = args.command.module() else {
        print_modules();
        return Ok(());
    };

    let shutdown = Shutdown::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping {id}");
            interrupt.cancel();
        }
    });

    let produced = run_module(id, options, &Providers::default(), shutdown)
        .await
        .with_context(|| format!("Failed to run {id}"))?;
    info!("{id} finished with {}", Counted::regular(produced, "result"));
    Ok(())
}
