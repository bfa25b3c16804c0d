use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use vmbridge::{Config, Status};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// Path to config file
    #[clap(short, long, default_value = "vmbridge.toml")]
    config: PathBuf,
}

/// Initialize logging to stderr, honoring `RUST_LOG`.
fn init_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .default_format()
        .try_init()
        .context("Failed to init env_logger")?;
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {path:?}"))?;
    toml::from_str(&contents).context("Failed to parse config")
}

/// Log each lifecycle status update as it arrives, until the channel closes.
fn log_status(rx: mpsc::Receiver<Status>) {
    for status in rx {
        match status {
            Status::ServerStarting(name) => info!("{name} server starting"),
            Status::ServerUp(name) => info!("{name} server up"),
            Status::ServerDown(name, Ok(())) => info!("{name} server stopped"),
            Status::ServerDown(name, Err(e)) => info!("{name} server failed: {e:#}"),
            Status::LockStart => info!("acquiring singleton lock"),
            Status::LockEnd(Ok(())) => info!("singleton lock acquired"),
            Status::LockEnd(Err(e)) => info!("singleton lock not acquired: {e:#}"),
            Status::RescanStart => info!("checking update sources"),
            Status::RescanEnd(Ok(true)) => info!("newer bundle found and installed"),
            Status::RescanEnd(Ok(false)) => info!("no newer bundle found"),
            Status::RescanEnd(Err(e)) => info!("update rescan failed: {e:#}"),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging().context("Failed to initialize logging")?;
    let config = load_config(&args.config)?;

    let (status_tx, status_rx) = mpsc::channel();
    let logger = thread::spawn(move || log_status(status_rx));

    let result = vmbridge::run(config, status_tx);
    let _ = logger.join();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::Builder;

    #[test]
    fn test_load_config_reads_install_path() {
        let tmp_dir = Builder::new().tempdir().unwrap();
        let config_path = tmp_dir.path().join("vmbridge.toml");
        fs::write(&config_path, r#"install_path = "/opt/vmbridge""#).unwrap();

        let config = load_config(&config_path).expect("Failed to parse config");
        assert_eq!(config.install_path, PathBuf::from("/opt/vmbridge"));
    }

    #[test]
    fn test_load_config_missing_file_errors() {
        let result = load_config(&PathBuf::from("/nonexistent/vmbridge.toml"));
        assert!(result.is_err());
    }
}
