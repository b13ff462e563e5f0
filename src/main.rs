//! Command-line driver: extract both manifests, write or print the JSON
//! reports, and optionally dump the logged spawn-literal map.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;

use spawn_manifest::error::{Error, Result};
use spawn_manifest::{run, Options};

#[derive(Debug, Parser)]
#[command(
    name = "spawn-manifest",
    about = "Extract a spawn manifest from a decompiler listing and compare it with the repo sources"
)]
struct Cli {
    /// Path of the primary listing file
    #[arg(long, default_value = "references/HLIL/oblivion/gamex86.dll_hlil.txt")]
    hlil: PathBuf,

    /// Root of the C re-implementation
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Write the combined manifest JSON to this path
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write the comparison JSON to this path
    #[arg(long)]
    comparison: Option<PathBuf>,

    /// Pretty-print JSON when writing to stdout
    #[arg(long)]
    pretty: bool,

    /// Override a macro definition when parsing repo spawn data
    /// (NAME or NAME=VALUE)
    #[arg(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
    define: Vec<String>,

    /// Write the interpreted spawn-literal map to this path
    #[arg(long = "dump-b150-map", value_name = "PATH")]
    dump_b150_map: Option<PathBuf>,
}

fn parse_defines(definitions: &[String]) -> Vec<(String, String)> {
    let mut overrides = Vec::new();
    for definition in definitions {
        let (name, value) = match definition.split_once('=') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => (definition.trim(), "1"),
        };
        if name.is_empty() {
            continue;
        }
        let value = if value.is_empty() { "1" } else { value };
        overrides.push((name.to_string(), value.to_string()));
    }
    overrides
}

/// Serialization of our report types cannot fail: every map is keyed by
/// strings and non-finite floats fall back to null.
fn render<T: Serialize>(value: &T, pretty: bool) -> String {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(text) => text,
        Err(_) => unreachable!(),
    }
}

fn write_report<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, render(value, true)).map_err(|e| Error::io(path, &e))
}

#[derive(Serialize)]
struct StdoutReport<'a> {
    combined: &'a spawn_manifest::Combined,
    comparison: &'a spawn_manifest::compare::Comparison,
}

fn run_cli(cli: &Cli) -> Result<()> {
    let options = Options::builder()
        .hlil(cli.hlil.clone())
        .repo(cli.repo.clone())
        .defines(parse_defines(&cli.define))
        .build();
    let output = run(&options)?;

    if let Some(path) = cli.dump_b150_map.as_deref() {
        write_report(path, &output.logged_map)?;
    }
    if let Some(path) = cli.output.as_deref() {
        write_report(path, &output.combined)?;
    }
    if let Some(path) = cli.comparison.as_deref() {
        write_report(path, &output.comparison)?;
    }

    if cli.output.is_none() {
        let report = StdoutReport {
            combined: &output.combined,
            comparison: &output.comparison,
        };
        print!("{}", render(&report, cli.pretty));
        if cli.pretty {
            println!();
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run_cli(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_define_parsing() {
        let overrides = parse_defines(&[
            "OBLIVION_ENABLE_MONSTER_SENTINEL=0".to_string(),
            "BARE_FLAG".to_string(),
            "EMPTY=".to_string(),
        ]);
        assert_eq!(
            overrides,
            vec![
                (
                    "OBLIVION_ENABLE_MONSTER_SENTINEL".to_string(),
                    "0".to_string()
                ),
                ("BARE_FLAG".to_string(), "1".to_string()),
                ("EMPTY".to_string(), "1".to_string()),
            ]
        );
    }
}
