mod catalog_daemon;
mod config;
mod scheduler;
mod workers;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::catalog_daemon::{run_catalog_daemon, CatalogDaemonRunOptions};
use crate::config::DEFAULT_CATALOG_DAEMON_CONFIG_PATH;

fn usage() -> String {
    format!(
        "usage: catalog_daemon [--config <path>] [--once]\n\
         defaults:\n\
         --config {}",
        DEFAULT_CATALOG_DAEMON_CONFIG_PATH
    )
}

fn parse_args_from(args: &[String]) -> Result<CatalogDaemonRunOptions, String> {
    let mut config_path = PathBuf::from(DEFAULT_CATALOG_DAEMON_CONFIG_PATH);
    let mut once = false;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            "--once" => {
                once = true;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(CatalogDaemonRunOptions { config_path, once })
}

fn parse_args() -> Result<CatalogDaemonRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    parse_args_from(&args)
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_catalog_daemon(options) {
        error!("run catalog_daemon failed: {}", err);
        std::process::exit(1);
    }
}
