use clap::Parser;
use std::path::PathBuf;

/// Command-line surface.
///
/// Everything here is also settable through the config file and `QUARRY_*`
/// environment variables; flags win over both.
#[derive(Debug, Default, Parser)]
#[command(
    name = "quarry",
    version,
    about = "Pull binary artifacts from an object store, scan them with YARA rules, record every match"
)]
pub struct Cli {
    /// Path to a configuration file (TOML, or YAML by extension).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Source bucket to sync artifacts from.
    #[arg(long)]
    pub bucket: Option<String>,

    /// Directory artifacts are downloaded into and scanned from.
    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,

    /// Directory of YARA rule sources.
    #[arg(long)]
    pub rule_dir: Option<PathBuf>,

    /// SQLite database recording artifacts, rules, and results.
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Worker count for the download and scan pools.
    #[arg(long)]
    pub workers: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_overrides() {
        let cli = Cli::parse_from([
            "quarry",
            "--bucket",
            "malware-drop",
            "--artifact-dir",
            "/var/lib/quarry/bins",
            "--workers",
            "8",
        ]);
        assert_eq!(cli.bucket.as_deref(), Some("malware-drop"));
        assert_eq!(cli.workers, Some(8));
        assert!(cli.config.is_none());
    }
}
