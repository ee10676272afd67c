mod ess_daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::ess_daemon::{parse_daemon_list, run_ess_daemon, EssDaemonRunOptions};
use ess_daemons::{ALL_DAEMONS, DEFAULT_CONFIG_PATH, ESS_CONFIG_ENV};

fn usage() -> String {
    format!(
        "usage: ess_daemon [--config <path>] [--daemons <name,name,...>]\n\
         defaults:\n\
         --config ${} or {}\n\
         --daemons [common] daemons from the config\n\
         daemons: {}",
        ESS_CONFIG_ENV,
        DEFAULT_CONFIG_PATH,
        ALL_DAEMONS.join(", ")
    )
}

fn parse_args(args: &[String]) -> Result<EssDaemonRunOptions, String> {
    let mut options = EssDaemonRunOptions::default();
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                options.config_path = Some(PathBuf::from(value));
            }
            "--daemons" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --daemons".to_string())?;
                options.daemons = Some(parse_daemon_list(value)?);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }
    Ok(options)
}

fn main() {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_ess_daemon(options) {
        error!("run ess_daemon failed: {}", err);
        eprintln!("run ess_daemon failed: {}", err);
        std::process::exit(1);
    }
}
