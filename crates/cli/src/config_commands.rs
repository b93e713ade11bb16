use std::path::{Path, PathBuf};

use anyhow::Result;

use guildrelay_config::{RelayConfig, Severity, find_config_file, load_config, validate};

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Load the explicit config file, or the first one discovered. Defaults
/// apply only when no file exists; a broken file is an error.
pub fn load(explicit: Option<&Path>) -> Result<(Option<PathBuf>, RelayConfig)> {
    let path = explicit.map(Path::to_path_buf).or_else(find_config_file);
    match path {
        Some(path) => {
            let config = load_config(&path)?;
            Ok((Some(path), config))
        },
        None => Ok((None, RelayConfig::default())),
    }
}

/// Validate the configuration and print diagnostics. Exits non-zero on errors.
pub fn check(explicit: Option<&Path>, verbose: bool) -> Result<()> {
    let (path, config) = load(explicit)?;

    if let Some(ref path) = path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let result = validate(&config);

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}
