use std::path::PathBuf;

use crate::{
    cli::Cli,
    types::{Fidelity, Layout},
};

/// Invocation parameters for one verification run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Config {
    pub dat: PathBuf,
    pub input: PathBuf,
    pub fidelity: Fidelity,
    pub convert: Option<Layout>,
    pub output: Option<PathBuf>,
    pub rebuild_from: Option<PathBuf>,
    pub filter: Vec<String>,
    pub report_all: bool,
    pub jobs: Option<usize>,
    pub report: Option<PathBuf>,
    pub verbose: u8,
    pub quiet: u8,
}

impl Config {
    /// Folder that receives written archives.
    pub fn target_folder(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| self.input.clone())
    }

    pub fn writes_elsewhere(&self) -> bool {
        self.output.as_ref().is_some_and(|o| *o != self.input)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.unwrap_or_else(num_cpus::get).max(1)
    }

    fn validate_paths(&self) -> anyhow::Result<()> {
        if self.dat.as_os_str().is_empty() {
            anyhow::bail!("--dat is required");
        }
        if self.input.as_os_str().is_empty() {
            anyhow::bail!("--input is required");
        }
        if self.rebuild_from.as_ref() == Some(&self.input) {
            anyhow::bail!("--rebuild-from must differ from --input");
        }
        Ok(())
    }

    fn validate_jobs(&self) -> anyhow::Result<()> {
        if self.jobs == Some(0) {
            anyhow::bail!("--jobs must be at least 1");
        }
        Ok(())
    }

    fn validate_filter(&self) -> anyhow::Result<()> {
        crate::build_globset(&self.filter)
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("invalid --filter pattern: {e}"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_paths()?;
        self.validate_jobs()?;
        self.validate_filter()?;
        Ok(())
    }
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let config = Self {
            dat: cli.dat,
            input: cli.input,
            fidelity: cli.fidelity,
            convert: cli.convert,
            output: cli.output,
            rebuild_from: cli.rebuild_from,
            filter: cli.filter,
            report_all: cli.report_all,
            jobs: cli.jobs,
            report: cli.report,
            verbose: cli.verbose,
            quiet: cli.quiet,
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_defaults() {
        let cli = Cli::parse_from(["romset", "--dat", "a.dat", "--input", "roms"]);
        let config = Config::try_from(cli).expect("config should parse");
        assert_eq!(config.fidelity, Fidelity::Fast);
        assert_eq!(config.target_folder(), PathBuf::from("roms"));
        assert!(!config.writes_elsewhere());
        assert!(config.job_count() >= 1);
    }

    #[test]
    fn parses_full_invocation() {
        let cli = Cli::parse_from([
            "romset",
            "-d",
            "a.dat",
            "-i",
            "roms",
            "--fidelity",
            "slow",
            "--convert",
            "split",
            "-o",
            "out",
            "--rebuild-from",
            "spare",
            "-f",
            "mslug*",
            "-f",
            "kof98",
            "--report-all",
            "-j",
            "2",
            "-vv",
        ]);
        let config = Config::try_from(cli).expect("config should parse");
        assert_eq!(config.fidelity, Fidelity::Slow);
        assert_eq!(config.convert, Some(Layout::Split));
        assert_eq!(config.target_folder(), PathBuf::from("out"));
        assert!(config.writes_elsewhere());
        assert_eq!(config.filter, vec!["mslug*", "kof98"]);
        assert!(config.report_all);
        assert_eq!(config.job_count(), 2);
        assert_eq!(config.verbose, 2);
    }

    #[test]
    fn errors_when_jobs_is_zero() {
        let cli = Cli::parse_from(["romset", "-d", "a.dat", "-i", "roms", "-j", "0"]);
        let err = Config::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("--jobs must be at least 1"));
    }

    #[test]
    fn errors_when_rebuild_source_is_the_input() {
        let cli = Cli::parse_from([
            "romset",
            "-d",
            "a.dat",
            "-i",
            "roms",
            "--rebuild-from",
            "roms",
        ]);
        let err = Config::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn errors_on_bad_filter_glob() {
        let cli = Cli::parse_from(["romset", "-d", "a.dat", "-i", "roms", "-f", "[oops"]);
        let err = Config::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("invalid --filter"));
    }

    #[test]
    fn default_config_fails_validation() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("--dat is required"));
    }
}
