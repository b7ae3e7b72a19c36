use clap::Parser as _;
use genvex_tunnel_tools::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Discover(commands::discover::Args),
    Read(commands::read::Args),
    Set(commands::set::Args),
    Monitor(commands::monitor::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

#[tokio::main]
async fn main() {
    let filter_description = std::env::var("GENVEX_TUNNEL_LOG").unwrap_or_default();
    let filter = filter_description
        .parse::<tracing_subscriber::filter::targets::Targets>()
        .expect("GENVEX_TUNNEL_LOG must be a valid tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Discover(args) => end(commands::discover::run(args).await),
        Commands::Read(args) => end(commands::read::run(args).await),
        Commands::Set(args) => end(commands::set::run(args).await),
        Commands::Monitor(args) => end(commands::monitor::run(args).await),
    }
}
