use anyhow::{Result, bail};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    if std::env::var("NO_FRIENDLY_PANIC").is_err() {
        human_panic::setup_panic!();
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config_file = match args.next() {
        Some(arg) => PathBuf::from(arg),
        None => bail!("Usage: utron-tools <config.toml>"),
    };
    if args.next().is_some() {
        bail!("Usage: utron-tools <config.toml>");
    }
    utron_tools::run(&config_file)
}
