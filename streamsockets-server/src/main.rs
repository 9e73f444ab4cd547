use clap::Parser;
use streamsockets_server::{app, config::Config};

fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = config.child_threads {
        builder.worker_threads(threads.max(1));
    }
    let runtime = builder.build()?;

    runtime.block_on(app::run(config))
}
