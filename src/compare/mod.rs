//! Diffing the listing-derived manifest against the repo-derived one.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::manifest::{ClassnameEntry, DefaultValue, SourceTag, SPAWN_ITEM_SENTINEL};
use crate::repo::RepoEntry;

/// Tolerance for float default comparisons, applied both relatively and
/// absolutely
const FLOAT_TOLERANCE: f64 = 1e-4;

/// Per-key spawnflag mismatch: the listing values and the repo values
pub type SpawnflagDiff = BTreeMap<String, (Vec<u32>, Vec<u32>)>;
/// Per-field default mismatch: the listing entries and the repo value
pub type DefaultDiff = BTreeMap<String, (Vec<DefaultValue>, Option<f64>)>;

#[derive(Debug, Default, Serialize)]
/// The complete comparison report
pub struct Comparison {
    /// Shared classnames with diverging default values
    pub default_mismatches: BTreeMap<String, DefaultDiff>,
    /// Shared classnames whose spawn function has no analyzable block
    pub hlil_missing_blocks: Vec<String>,
    /// Classnames only the repo registers
    pub missing_in_hlil: Vec<String>,
    /// Classnames only the listing knows
    pub missing_in_repo: Vec<String>,
    /// Shared classnames with diverging spawnflag evidence
    pub spawnflag_mismatches: BTreeMap<String, SpawnflagDiff>,
}

fn close_enough(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= (FLOAT_TOLERANCE * scale).max(FLOAT_TOLERANCE)
}

/// The canonical representative of a listing default: the entry whose
/// serialized form sorts first
fn canonical_value(entries: &[DefaultValue]) -> Option<f64> {
    entries
        .iter()
        .filter_map(|entry| serde_json::to_string(entry).ok().map(|text| (text, entry)))
        .min_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, entry)| entry.value.as_f64())
}

/// Compare the two manifests. Item-sentinel repo entries are never diffed;
/// spawnflag diffs require listing-side evidence.
pub fn compare(
    hlil: &BTreeMap<String, ClassnameEntry>,
    repo: &BTreeMap<String, RepoEntry>,
) -> Comparison {
    let mut result = Comparison {
        missing_in_repo: hlil
            .keys()
            .filter(|name| !repo.contains_key(*name))
            .cloned()
            .collect(),
        missing_in_hlil: repo
            .keys()
            .filter(|name| !hlil.contains_key(*name))
            .cloned()
            .collect(),
        ..Comparison::default()
    };

    for (classname, hl) in hlil {
        let Some(rp) = repo.get(classname) else {
            continue;
        };
        if !hl.has_block {
            result.hlil_missing_blocks.push(classname.clone());
        }
        if rp.function == SPAWN_ITEM_SENTINEL {
            continue;
        }

        if hl.spawnflags_source != SourceTag::None {
            let mut diff = SpawnflagDiff::new();
            let pairs = [
                ("checks", &hl.spawnflags.checks, &rp.spawnflags.checks),
                ("sets", &hl.spawnflags.sets, &rp.spawnflags.sets),
                ("clears", &hl.spawnflags.clears, &rp.spawnflags.clears),
                (
                    "assignments",
                    &hl.spawnflags.assignments,
                    &rp.spawnflags.assignments,
                ),
            ];
            for (key, hl_set, rp_set) in pairs {
                if hl_set != rp_set {
                    diff.insert(
                        key.to_string(),
                        (
                            hl_set.iter().copied().collect(),
                            rp_set.iter().copied().collect(),
                        ),
                    );
                }
            }
            if !diff.is_empty() {
                result.spawnflag_mismatches.insert(classname.clone(), diff);
            }
        }

        let mut diff = DefaultDiff::new();
        for (field, entries) in &hl.defaults {
            match rp.defaults.get(field) {
                None => {
                    diff.insert(field.clone(), (entries.clone(), None));
                }
                Some(repo_value) => {
                    let matches = canonical_value(entries)
                        .map(|value| close_enough(value, *repo_value))
                        .unwrap_or(true);
                    if !matches {
                        diff.insert(field.clone(), (entries.clone(), Some(*repo_value)));
                    }
                }
            }
        }
        if !diff.is_empty() {
            result.default_mismatches.insert(classname.clone(), diff);
        }
    }

    result
}
