//! Merging classname-to-spawn-function evidence from the listing, the
//! image tables, the item table, and the interpreted sidecars.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::compiled;
use crate::listing::analysis::{self, OrderedEntries};
use crate::tables;

use super::{normalize_classname, Extractor, SPAWN_ITEM_SENTINEL};

/// Helpers whose call sites carry classname literals registered through the
/// controller dispatcher
const CONTROLLER_HELPERS: [&str; 2] = ["sub_1001ad80", "sub_100166e7"];
/// Classname prefixes recognized by the fallback controller scan
const CLASSNAME_PREFIXES: [&str; 17] = [
    "target_", "trigger_", "func_", "misc_", "monster_", "path_", "info_", "weapon_", "item_",
    "ammo_", "key_", "turret_", "point_", "bodyque_", "light_", "script_", "model_",
];
/// Literals that look like classnames but are known not to be
const DENYLIST: [&str; 3] = ["%s/listip.cfg", "j", "player_noise"];

static QUOTED_LITERAL: LazyLock<Regex> = LazyLock::new(|| compiled(r#""([a-z0-9_]+)""#));

#[derive(Debug, Clone, Default, Deserialize)]
/// One entry of the `interpreted/controller_classnames.json` sidecar
pub struct ControllerClassname {
    #[serde(default)]
    /// The registered classname
    pub classname: Option<String>,
    #[serde(default)]
    /// The function that registered it
    pub function: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One entry of the logged spawn-literal map, persisted as
/// `interpreted/sub_1000b150_map.json` and reconstructible from the spawn
/// table's text labels
pub struct LoggedEntry {
    /// The classname the literal maps to
    pub classname: String,
    /// The spawn function bound to the classname
    pub function: String,
    /// Spawn-table record index the literal matched
    pub index: usize,
    /// The logged literal itself
    pub literal: String,
    #[serde(default)]
    /// Listing sources containing the logging call
    pub sources: Vec<String>,
}

fn looks_like_classname(literal: &str) -> bool {
    if literal.is_empty() || !literal.contains('_') {
        return false;
    }
    let lower = literal.to_ascii_lowercase();
    CLASSNAME_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Classnames registered through the controller dispatcher: the sidecar
/// when it has entries, otherwise a scan of every block downstream of the
/// first dispatcher call for classname-shaped literals.
fn controller_entries(extractor: &Extractor) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    let path = extractor.listing().interpreted_dir().join("controller_classnames.json");
    if let Ok(text) = std::fs::read_to_string(&path) {
        match serde_json::from_str::<Vec<ControllerClassname>>(&text) {
            Ok(records) => {
                for record in records {
                    let (Some(classname), Some(function)) = (record.classname, record.function)
                    else {
                        continue;
                    };
                    if classname.is_empty() || function.is_empty() {
                        continue;
                    }
                    entries
                        .entry(normalize_classname(&classname))
                        .or_insert(function);
                }
            }
            Err(e) => log::warn!("ignoring malformed {:?}: {}", path, e),
        }
    }
    if !entries.is_empty() {
        return entries;
    }

    for (func_name, block) in extractor.listing().function_blocks().iter() {
        let Some(call_index) = block
            .iter()
            .position(|line| CONTROLLER_HELPERS.iter().any(|helper| line.contains(helper)))
        else {
            continue;
        };
        for line in &block[call_index..] {
            for caps in QUOTED_LITERAL.captures_iter(line) {
                let Some(literal) = caps.get(1) else { continue };
                let normalized = normalize_classname(literal.as_str());
                if !looks_like_classname(&normalized) {
                    continue;
                }
                entries.entry(normalized).or_insert_with(|| func_name.to_string());
            }
        }
    }
    entries
}

fn persisted_logged_entries(extractor: &Extractor) -> BTreeMap<String, LoggedEntry> {
    let mut entries = BTreeMap::new();
    let path = extractor
        .listing()
        .interpreted_dir()
        .join("sub_1000b150_map.json");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return entries;
    };
    let records: Vec<LoggedEntry> = match serde_json::from_str(&text) {
        Ok(records) => records,
        Err(e) => {
            log::warn!("ignoring malformed {:?}: {}", path, e);
            return entries;
        }
    };
    for mut record in records {
        record.classname = normalize_classname(&record.classname);
        record.sources.sort();
        entries.insert(record.classname.clone(), record);
    }
    entries
}

fn interpreted_logged_entries(extractor: &Extractor) -> BTreeMap<String, LoggedEntry> {
    let literal_sources = extractor.listing().logged_literals();
    let mut entries = BTreeMap::new();
    if literal_sources.is_empty() {
        return entries;
    }
    let mut text_map: BTreeMap<String, &tables::SpawnRecord> = BTreeMap::new();
    for record in extractor.spawn_records() {
        if let Some(label) = record.text_label.as_deref() {
            text_map.entry(label.to_ascii_lowercase()).or_insert(record);
        }
    }
    for (literal, sources) in literal_sources {
        let Some(record) = text_map.get(&literal.to_ascii_lowercase()) else {
            continue;
        };
        let classname = normalize_classname(&record.classname);
        entries.insert(
            classname.clone(),
            LoggedEntry {
                classname,
                function: record.function.clone(),
                index: record.index,
                literal: literal.clone(),
                sources: sources.iter().cloned().collect(),
            },
        );
    }
    entries
}

/// The logged spawn-literal map: persisted sidecar entries merged with the
/// ones interpretable from the current listing and image, unioning their
/// source lists
pub(crate) fn logged_entries(extractor: &Extractor) -> BTreeMap<String, LoggedEntry> {
    let mut entries = persisted_logged_entries(extractor);
    for (classname, mut record) in interpreted_logged_entries(extractor) {
        if let Some(existing) = entries.get(&classname) {
            let mut sources: BTreeSet<String> = existing.sources.iter().cloned().collect();
            sources.extend(record.sources.iter().cloned());
            record.sources = sources.into_iter().collect();
        }
        entries.insert(classname, record);
    }
    entries
}

/// Build the classname-to-function map by merging every evidence source in
/// priority order; earlier sources win, except that a logged entry may
/// replace an itemlist sentinel binding.
pub(crate) fn build(extractor: &Extractor) -> BTreeMap<String, String> {
    let mut entries: BTreeMap<String, String> = BTreeMap::new();
    let claim = |entries: &mut BTreeMap<String, String>, classname: String, func: String| {
        entries.entry(classname).or_insert(func);
    };

    // Paired data declarations are the strongest evidence.
    for (classname, func) in extractor.listing().direct_pairs() {
        claim(
            &mut entries,
            normalize_classname(classname),
            func.clone(),
        );
    }

    // Per-block evidence: inline registration tables, the auxiliary pair
    // table when a block refers to it, and dispatch chains.
    let resolver = extractor.resolver();
    for (_, block) in extractor.listing().function_blocks().iter() {
        let mut per_block = OrderedEntries::default();
        for (token, func) in analysis::inline_table_entries(block) {
            let Some(literal) = resolver.resolve_token(&token) else {
                continue;
            };
            let normalized = normalize_classname(literal);
            if normalized.is_empty() {
                continue;
            }
            per_block.insert_first(normalized, func);
        }
        let text = block.join("\n").to_ascii_lowercase();
        if text.contains("spawn function") && text.contains("data_1004a5c0") {
            if let Some(pe) = extractor.image() {
                for (classname, func) in tables::read_pair_table(
                    pe,
                    resolver,
                    tables::AUX_SPAWN_TABLE_VA,
                    tables::PAIR_RECORD_SIZE,
                ) {
                    per_block.insert_first(classname, func);
                }
            }
        }
        for (classname, func) in analysis::switch_dispatch_entries(block, &per_block) {
            per_block.insert_first(classname, func);
        }
        for (classname, func) in per_block.iter() {
            claim(&mut entries, classname.to_string(), func.to_string());
        }
        for (classname, func) in analysis::literal_dispatch_entries(block).iter() {
            claim(&mut entries, classname.to_string(), func.to_string());
        }
    }

    // Image spawn-table records.
    for record in extractor.spawn_records() {
        claim(
            &mut entries,
            record.classname.clone(),
            record.function.clone(),
        );
    }

    // Item table classnames spawn through the item system unless stronger
    // evidence already bound them.
    let items = extractor.itemlist();
    for classname in items.keys() {
        claim(
            &mut entries,
            classname.clone(),
            SPAWN_ITEM_SENTINEL.to_string(),
        );
    }
    let mut interpreted_weapons: BTreeSet<String> = BTreeSet::new();
    for entry in extractor.listing().interpreted_strings() {
        if entry.category.as_deref() != Some("weapon_descriptor") {
            continue;
        }
        let Some(value) = entry.value.as_deref() else {
            continue;
        };
        let normalized = normalize_classname(value);
        if normalized.starts_with("weapon_") {
            interpreted_weapons.insert(normalized);
        }
    }
    for classname in interpreted_weapons {
        if items.contains_key(&classname) {
            claim(&mut entries, classname, SPAWN_ITEM_SENTINEL.to_string());
        }
    }

    // Controller-registered classnames.
    for (classname, func) in controller_entries(extractor) {
        claim(&mut entries, classname, func);
    }

    // Logged literals may upgrade an itemlist sentinel.
    for (classname, record) in extractor.logged_entries() {
        let replace = match entries.get(classname) {
            None => true,
            Some(existing) => existing == SPAWN_ITEM_SENTINEL,
        };
        if replace {
            entries.insert(classname.clone(), record.function.clone());
        }
    }

    for ignored in DENYLIST {
        entries.remove(ignored);
    }

    log::info!("spawn map holds {} classnames", entries.len());
    entries
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_classname_shapes() {
        assert!(looks_like_classname("monster_jorg"));
        assert!(looks_like_classname("target_speaker"));
        assert!(!looks_like_classname("jorg"));
        assert!(!looks_like_classname("classname"));
        assert!(!looks_like_classname(""));
    }
}
