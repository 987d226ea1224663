use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use unminify_lite_lib::deobfuscate::{Deobfuscator, RuleSet, TransformOptions};
use unminify_lite_lib::{deobfuscate_files, scan_project, FileReport};

#[derive(Parser)]
#[command(name = "unminify-lite")]
#[command(about = "Make minified or obfuscated JavaScript readable again", long_about = None)]
#[command(version)]
struct Cli {
    /// Files or directories to transform
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// JSON file with transform options
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON rule table replacing the built-in one
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Print the full report as JSON instead of code
    #[arg(long)]
    json: bool,

    /// Write transformed files here, mirroring input layout
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Skip identifier renaming
    #[arg(long)]
    no_rename: bool,

    /// Skip the string decoding cascade
    #[arg(long)]
    no_decode: bool,

    /// Skip the final pretty-print
    #[arg(long)]
    no_format: bool,
}

/// Input file plus the path it should take under `--out-dir`
struct Input {
    path: PathBuf,
    relative: PathBuf,
}

fn load_options(cli: &Cli) -> Result<TransformOptions> {
    let options = match &cli.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            TransformOptions::from_json_str(&json)?
        }
        None => TransformOptions::default(),
    };
    let mut options = options.with_env_overrides();
    if cli.no_rename {
        options.rename_identifiers = false;
    }
    if cli.no_decode {
        options.decode_strings = false;
    }
    if cli.no_format {
        options.pretty_print = false;
    }
    Ok(options)
}

fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<Input>> {
    let mut inputs = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in scan_project(path)? {
                inputs.push(Input {
                    relative: PathBuf::from(&entry.relative_path),
                    path: entry.path,
                });
            }
        } else if path.is_file() {
            let name = path
                .file_name()
                .map(PathBuf::from)
                .with_context(|| format!("{} has no file name", path.display()))?;
            inputs.push(Input {
                path: path.clone(),
                relative: name,
            });
        } else {
            bail!("{} does not exist", path.display());
        }
    }
    Ok(inputs)
}

/// Two inputs landing on the same `--out-dir` path would overwrite each other
fn ensure_distinct_targets(inputs: &[Input]) -> Result<()> {
    let mut seen: HashMap<&Path, &Path> = HashMap::new();
    for input in inputs {
        if let Some(previous) = seen.insert(&input.relative, &input.path) {
            if previous != input.path.as_path() {
                bail!(
                    "{} and {} would both be written to {}",
                    previous.display(),
                    input.path.display(),
                    input.relative.display()
                );
            }
        }
    }
    Ok(())
}

fn write_output(out_dir: &Path, relative: &Path, code: &str) -> Result<()> {
    let target = out_dir.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&target, code).with_context(|| format!("failed to write {}", target.display()))?;
    info!("wrote {}", target.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = load_options(&cli)?;
    let mut deobfuscator = Deobfuscator::new(options);
    if let Some(path) = &cli.rules {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read rules {}", path.display()))?;
        deobfuscator = deobfuscator.with_rules(RuleSet::from_json(&json)?);
    }

    let inputs = collect_inputs(&cli.paths)?;
    if inputs.is_empty() {
        bail!("no JavaScript or TypeScript files found");
    }
    if cli.out_dir.is_some() {
        ensure_distinct_targets(&inputs)?;
    }
    info!("processing {} file(s)", inputs.len());

    let paths: Vec<PathBuf> = inputs.iter().map(|i| i.path.clone()).collect();
    let results = deobfuscate_files(&paths, &deobfuscator);

    let mut reports: Vec<FileReport> = Vec::new();
    let mut failures = 0usize;
    for (input, result) in inputs.iter().zip(results) {
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!("{}: {}", input.path.display(), e);
                failures += 1;
                continue;
            }
        };
        if let Some(error) = &report.result.error {
            warn!("{}: {}", input.path.display(), error);
            failures += 1;
        }
        if let Some(out_dir) = &cli.out_dir {
            write_output(out_dir, &input.relative, &report.result.code)?;
        }
        reports.push(report);
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if cli.out_dir.is_none() {
        let multiple = reports.len() > 1;
        for report in &reports {
            if multiple {
                println!("// ==> {} <==", report.path.display());
            }
            print!("{}", report.result.code);
        }
    }

    if failures > 0 {
        bail!("{} file(s) could not be transformed", failures);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_files_collide_under_out_dir() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["a", "b"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
            fs::write(dir.path().join(sub).join("app.js"), "var x = 1;").unwrap();
        }
        let inputs = collect_inputs(&[dir.path().join("a/app.js"), dir.path().join("b/app.js")]).unwrap();
        let err = ensure_distinct_targets(&inputs).unwrap_err().to_string();
        assert!(err.contains("app.js"), "{err}");
    }

    #[test]
    fn test_distinct_and_repeated_inputs_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.js"), "var x = 1;").unwrap();
        fs::write(dir.path().join("vendor.js"), "var y = 2;").unwrap();
        let app = dir.path().join("app.js");
        let inputs = collect_inputs(&[app.clone(), dir.path().join("vendor.js"), app]).unwrap();
        assert!(ensure_distinct_targets(&inputs).is_ok());
    }
}
