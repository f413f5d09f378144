//! Loads a configuration, applies command-line overrides, compiles the
//! filters, and prints the resulting policy. Exits non-zero on the first
//! parse error, after printing the offending file and line.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use divert_core::config::cmdline;
use divert_core::config::Config;

#[derive(Parser, Debug)]
#[command(name = "checkconf", about = "validate and dump a divert policy")]
struct Args {
    /// Configuration file to load.
    #[arg(short = 'f', long = "conf", value_name = "FILE")]
    conf: Option<PathBuf>,

    /// Apply one configuration directive, KEY=VAL. Repeatable.
    #[arg(short = 'o', value_name = "KEY=VAL")]
    opt: Vec<String>,

    /// Split mode: terminate TLS but never divert to an inspector.
    #[arg(short = 'n', long = "split")]
    split: bool,

    /// Dump the compiled filter trees as well.
    #[arg(short = 'F', long = "filters")]
    filters: bool,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut config = Config::new();
    if let Some(path) = &args.conf {
        config.load_file(path)?;
    }
    cmdline::apply_opts(&mut config, &args.opt)?;
    config.finalize(args.split)?;

    print!("{}", config.dump());
    if args.filters {
        if let Some(tree) = &config.opts.filter {
            print!("{}", tree);
        }
        for spec in &config.specs {
            println!("proxyspec {}", spec);
            if let Some(tree) = &spec.opts.filter {
                print!("{}", tree);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("checkconf: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
