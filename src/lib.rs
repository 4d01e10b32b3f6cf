// Lightweight verbosity-gated logging helper used throughout the crate.
macro_rules! vprintln {
	($verbose:expr, $level:expr, $($arg:tt)*) => {
		if $verbose >= $level {
			eprintln!($($arg)*);
		}
	};
}

// Public library re-exports for integration tests and external use.
pub mod archive;
pub mod catalog;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod dat;
pub mod error;
pub mod layout;
pub mod progress;
pub mod repair;
pub mod report;
pub mod types;
pub mod verify;

// Keep main.rs thin and have it call into the library functions.
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Compile name filters into a matcher. Plain names match themselves; glob
/// metacharacters are honoured.
pub fn build_globset(patterns: &[String]) -> anyhow::Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)?;
        builder.add(glob);
    }

    Ok(Some(builder.build()?))
}
