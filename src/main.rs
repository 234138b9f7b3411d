mod applog;
mod argv;
mod client;
mod config;
mod debuglog;
mod filelock;
mod layout;
mod protocol;
mod pty;
mod session;
mod utils;
mod worker;

use std::collections::HashSet;
use std::ffi::OsString;
use std::time::Duration;

use anyhow::{anyhow, Result};
use argument_parser::Parser;

use config::Config;
use layout::PathLayout;

enum Mode {
    Client,
    Worker,
    ConfigGet(String),
    ConfigSet(String, String),
    ConfigPath,
}

fn main() -> Result<()> {
    let mut parser = Parser::from_env();

    let mut mode = Mode::Client;
    let mut saw_subcommand = false;
    let mut route = None::<String>;
    let mut wait_worker_secs = 3.0f64;
    let mut max_jobs = None::<usize>;
    let mut poll_interval = None::<f64>;
    let mut accept_untagged = false;
    let mut debug = false;
    let mut cmdline = Vec::<OsString>::new();

    while let Some(param) = parser.param()? {
        match param {
            p if p.is_long("route") => {
                route = Some(parser.value()?);
            }
            p if p.is_long("wait-worker") => {
                wait_worker_secs = parser.value()?;
            }
            p if p.is_long("max-jobs") => {
                max_jobs = Some(parser.value()?);
            }
            p if p.is_long("poll-interval") => {
                poll_interval = Some(parser.value()?);
            }
            p if p.is_long("accept-untagged") => {
                accept_untagged = true;
            }
            p if p.is_long("debug") => {
                debug = true;
            }
            p if p.is_long("help") => {
                print_help();
                return Ok(());
            }
            p if p.is_pos() => {
                let word: String = parser.value()?;
                if !saw_subcommand && word == "worker" {
                    mode = Mode::Worker;
                } else if !saw_subcommand && word == "config" {
                    let action: String = parser.value()?;
                    mode = match action.as_str() {
                        "get" => Mode::ConfigGet(parser.value()?),
                        "set" => {
                            let key: String = parser.value()?;
                            let value: String = parser.value()?;
                            Mode::ConfigSet(key, value)
                        }
                        "path" => Mode::ConfigPath,
                        other => return Err(anyhow!("unknown config subcommand: {other}")),
                    };
                } else {
                    cmdline.push(OsString::from(word));
                }
                saw_subcommand = true;
            }
            _ => return Err(parser.unexpected().into()),
        }
    }

    match mode {
        Mode::ConfigGet(key) => {
            let cfg = Config::load()?;
            match cfg.get(&key) {
                Some(v) => println!("{v}"),
                None => return Err(anyhow!("unknown config key: {key}")),
            }
            return Ok(());
        }
        Mode::ConfigSet(key, value) => {
            Config::set(&key, &value)?;
            return Ok(());
        }
        Mode::ConfigPath => {
            let cfg = Config::load()?;
            match cfg.path() {
                Some(p) => println!("{}", p.display()),
                None => println!("(no config file)"),
            }
            return Ok(());
        }
        Mode::Client | Mode::Worker => {}
    }

    let mut config = Config::load()?;
    let mut pinned = HashSet::new();
    if max_jobs.is_some() {
        pinned.insert("max_jobs");
    }
    if accept_untagged {
        pinned.insert("accept_untagged");
        config.worker_accept_untagged = true;
    }
    if debug {
        pinned.insert("debug");
        config.worker_debug = true;
    }
    if let Some(n) = max_jobs {
        config.worker_max_jobs = n;
    }
    if let Some(p) = poll_interval {
        pinned.insert("poll_interval");
        config.worker_poll_interval = p;
    }
    if route.is_some() {
        pinned.insert("route");
        config.route = route.clone();
    }

    debuglog::init(config.worker_debug);

    let namespace = layout::resolve_namespace(config.namespace.as_deref());
    let layout = PathLayout::new(&config.cache_root, &namespace);
    layout.ensure_dirs()?;

    if matches!(mode, Mode::Worker) {
        let mut worker = worker::Worker::new(layout, config, pinned)?;
        return worker.run();
    }

    if cmdline.is_empty() {
        if std::env::args().count() <= 1 {
            print_help();
            return Ok(());
        }
        // Flags were given but no command words followed: refuse rather
        // than create a session with nothing to run.
        return Err(anyhow!("no command given"));
    }

    let opts = client::ClientOptions {
        argv: cmdline
            .into_iter()
            .map(|s| s.to_string_lossy().to_string())
            .collect(),
        route,
        wait_worker: Duration::from_secs_f64(wait_worker_secs),
    };
    let exit_code = client::run(&layout, &config, opts)?;
    std::process::exit(exit_code);
}

fn print_help() {
    println!("Usage: pigeon [options] -- <command>");
    println!("       pigeon worker [options]");
    println!("       pigeon config <get|set|path> [key] [value]");
    println!();
    println!("Options:");
    println!("  --route <name>          Only run on / only claim from a worker tagged <name>");
    println!("  --wait-worker <secs>     How long to wait for a live worker (default 3)");
    println!("  --max-jobs <n>          (worker) Maximum concurrent jobs");
    println!("  --poll-interval <secs>   (worker) Directory scan interval");
    println!("  --accept-untagged        (worker) Accept sessions with no --route");
    println!("  --debug                  Verbose structured logging");
    println!("  --help                   Show this help message");
}
