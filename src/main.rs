use std::fs;

use anyhow::Context;
use clap::Parser;

use romset::cli::Cli;
use romset::config::Config;
use romset::progress::ConsoleSink;
use romset::verify;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::try_from(cli)?;
    let mut sink = ConsoleSink::new(&config);
    let report = verify::run(&config, &mut sink)?;

    let serialized = serde_json::to_string_pretty(&report)?;
    match &config.report {
        Some(path) => fs::write(path, serialized)
            .with_context(|| format!("writing report to {}", path.display()))?,
        None => println!("{}", serialized),
    }

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
