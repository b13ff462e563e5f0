//! Reconstruction of a game's spawn manifest from a decompiler listing and
//! the shipped PE32 image, cross-checked against a C re-implementation.
//!
//! The listing side indexes function blocks and data declarations, merges
//! classname-to-spawn-function evidence from several independent sources,
//! and recovers default field writes and spawnflag operations either from
//! the listing text or by abstract interpretation of the image's machine
//! code. The repo side parses the C sources for the same facts, and the
//! comparator reports every divergence.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use regex::Regex;
use serde::Serialize;
use typed_builder::TypedBuilder;

pub mod compare;
pub mod error;
pub mod interp;
pub mod listing;
pub mod manifest;
pub mod pe;
pub mod repo;
pub mod tables;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
pub(crate) mod testutil;

use error::Result;
use manifest::spawnmap::LoggedEntry;
use manifest::{ClassnameEntry, Extractor};
use repo::{RepoEntry, RepoParser};

/// Compile a constant pattern. Every pattern in this crate is a literal
/// that is exercised by the test suite, so compilation cannot fail.
pub(crate) fn compiled(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(_) => unreachable!(),
    }
}

#[derive(Debug, TypedBuilder)]
/// Inputs of a full extraction run
pub struct Options {
    #[builder(setter(into))]
    /// Path of the primary listing file
    pub hlil: PathBuf,
    #[builder(setter(into))]
    /// Root of the C re-implementation
    pub repo: PathBuf,
    #[builder(default)]
    /// Macro overrides applied to the repo sources
    pub defines: Vec<(String, String)>,
}

#[derive(Debug, Serialize)]
/// Both manifests, keyed by classname
pub struct Combined {
    /// The listing/image-derived manifest
    pub hlil: BTreeMap<String, ClassnameEntry>,
    /// The repo-derived manifest
    pub repo: BTreeMap<String, RepoEntry>,
}

#[derive(Debug)]
/// Everything a run produces
pub struct RunOutput {
    /// Both manifests
    pub combined: Combined,
    /// The diff between them
    pub comparison: compare::Comparison,
    /// The logged spawn-literal map
    pub logged_map: Vec<LoggedEntry>,
}

/// Run the full extraction: build both manifests, diff them, and collect
/// the logged spawn-literal map. Only an unreadable listing or repo root
/// fails the run.
pub fn run(options: &Options) -> Result<RunOutput> {
    let extractor = Extractor::open(&options.hlil)?;
    let repo = RepoParser::new(&options.repo, &options.defines)?;

    let hlil_manifest = extractor.build_manifest();
    let repo_manifest = repo.build_manifest();
    let comparison = compare::compare(&hlil_manifest, &repo_manifest);
    let logged_map = extractor.logged_entry_list();

    Ok(RunOutput {
        combined: Combined {
            hlil: hlil_manifest,
            repo: repo_manifest,
        },
        comparison,
        logged_map,
    })
}
