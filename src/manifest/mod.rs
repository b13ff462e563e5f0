//! The spawn manifest data model and its assembly from listing, image, and
//! itemlist evidence.

pub mod spawnmap;

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::Result;
use crate::interp;
use crate::listing::analysis;
use crate::listing::strings::LiteralResolver;
use crate::listing::Listing;
use crate::pe::PeImage;
use crate::tables::{self, ItemRecord, SpawnRecord};
use crate::compiled;

use spawnmap::LoggedEntry;

/// Sentinel spawn-function name for classnames served from the item table
pub const SPAWN_ITEM_SENTINEL: &str = "SpawnItemFromItemlist";

static SUB_NAME: LazyLock<Regex> = LazyLock::new(|| compiled(r"(?i)^sub_([0-9a-f]+)"));

/// Strip surrounding whitespace and NUL padding from a classname
pub fn normalize_classname(classname: &str) -> String {
    classname.trim().trim_matches('\0').to_string()
}

/// Parse the virtual address out of a `sub_XXXXXXXX` symbol
pub fn parse_sub_address(name: &str) -> Option<u32> {
    let caps = SUB_NAME.captures(name)?;
    u32::from_str_radix(caps.get(1)?.as_str(), 16).ok()
}

/// Whether spawnflag evidence for a classname is collected across helper
/// callees rather than from the spawn function alone
pub(crate) fn follows_helpers(classname: &str) -> bool {
    if classname.is_empty() {
        return false;
    }
    if classname == "light" {
        return true;
    }
    const PREFIXES: [&str; 7] = [
        "func_", "target_", "trigger_", "misc_", "info_", "path_", "point_",
    ];
    PREFIXES.iter().any(|prefix| classname.starts_with(prefix))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
/// A recorded default value, integer or floating point depending on the
/// destination field's type
pub enum Value {
    /// A raw integer write
    Int(i64),
    /// A decoded floating-point write
    Float(f64),
}

impl Value {
    /// The value as a float regardless of representation
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(value) => *value as f64,
            Self::Float(value) => *value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// One observed write of a default into an entity field
pub struct DefaultValue {
    /// Byte offset of the destination field
    pub offset: u32,
    /// The written value
    pub value: Value,
}

/// Observed default writes grouped by field name
pub type DefaultMap = BTreeMap<String, Vec<DefaultValue>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
/// Bitmask evidence collected from operations on the spawnflags field
pub struct SpawnEvidence {
    /// Masks written outright
    pub assignments: BTreeSet<u32>,
    /// Masks tested against
    pub checks: BTreeSet<u32>,
    /// Bits removed, stored as the cleared bits rather than the AND operand
    pub clears: BTreeSet<u32>,
    /// Masks OR-ed in
    pub sets: BTreeSet<u32>,
}

impl SpawnEvidence {
    /// Whether no evidence was collected
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
            && self.checks.is_empty()
            && self.clears.is_empty()
            && self.sets.is_empty()
    }

    /// Union another evidence set into this one
    pub fn merge(&mut self, other: &SpawnEvidence) {
        self.assignments.extend(other.assignments.iter().copied());
        self.checks.extend(other.checks.iter().copied());
        self.clears.extend(other.clears.iter().copied());
        self.sets.extend(other.sets.iter().copied());
    }

    /// Record a cleared mask from an AND operand, storing the complement
    /// within the operation width and discarding degenerate all/none masks
    pub fn record_clear(&mut self, mask: u32, width_mask: u32) {
        let cleared = !mask & width_mask;
        if cleared > 0 && cleared < width_mask {
            self.clears.insert(cleared);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
/// Which evidence source produced a block, default set, or spawnflag set
pub enum SourceTag {
    /// No evidence
    None,
    /// The decompiler listing
    Hlil,
    /// Disassembly of the image
    Binary,
    /// The item table
    Itemlist,
}

#[derive(Debug, Clone, Serialize)]
/// One classname's manifest entry
pub struct ClassnameEntry {
    /// Where the analyzed block came from
    pub block_source: SourceTag,
    /// Observed default-field writes
    pub defaults: DefaultMap,
    /// Where the defaults came from
    pub defaults_source: SourceTag,
    /// The spawn function symbol, or the itemlist sentinel
    pub function: String,
    #[serde(skip)]
    /// Whether any block was found for the spawn function
    pub has_block: bool,
    /// Observed spawnflag evidence
    pub spawnflags: SpawnEvidence,
    /// Where the spawnflag evidence came from
    pub spawnflags_source: SourceTag,
}

impl ClassnameEntry {
    fn new(function: &str) -> Self {
        Self {
            block_source: SourceTag::None,
            defaults: DefaultMap::new(),
            defaults_source: SourceTag::None,
            function: function.to_string(),
            has_block: false,
            spawnflags: SpawnEvidence::default(),
            spawnflags_source: SourceTag::None,
        }
    }
}

/// The extraction engine: a listing, the image next to it when present, and
/// the lazily built evidence caches
pub struct Extractor {
    listing: Listing,
    pe: Option<PeImage>,
    resolver: OnceCell<LiteralResolver>,
    spawn_map: OnceCell<BTreeMap<String, String>>,
    records: OnceCell<Vec<SpawnRecord>>,
    items: OnceCell<BTreeMap<String, ItemRecord>>,
    logged: OnceCell<BTreeMap<String, LoggedEntry>>,
}

impl Extractor {
    /// Open the listing at `path` and the image derived from its name. A
    /// missing or malformed image degrades to listing-only extraction.
    pub fn open(path: &Path) -> Result<Self> {
        let listing = Listing::open(path)?;
        let pe = match listing.image_path() {
            Some(image_path) => match PeImage::load(image_path) {
                Ok(image) => Some(image),
                Err(e) => {
                    log::warn!("image unavailable, listing evidence only: {}", e);
                    None
                }
            },
            None => None,
        };
        Ok(Self {
            listing,
            pe,
            resolver: OnceCell::new(),
            spawn_map: OnceCell::new(),
            records: OnceCell::new(),
            items: OnceCell::new(),
            logged: OnceCell::new(),
        })
    }

    /// The underlying listing
    pub fn listing(&self) -> &Listing {
        &self.listing
    }

    /// The loaded image, when one was found
    pub fn image(&self) -> Option<&PeImage> {
        self.pe.as_ref()
    }

    /// The literal resolver over listing declarations and sidecar strings
    pub fn resolver(&self) -> &LiteralResolver {
        self.resolver
            .get_or_init(|| LiteralResolver::build(&self.listing))
    }

    /// Spawn-table records parsed from the image
    pub fn spawn_records(&self) -> &[SpawnRecord] {
        self.records.get_or_init(|| match self.pe.as_ref() {
            Some(pe) => tables::spawn_table_records(pe, self.resolver()),
            None => Vec::new(),
        })
    }

    /// The item table parsed from the image
    pub fn itemlist(&self) -> &BTreeMap<String, ItemRecord> {
        self.items.get_or_init(|| match self.pe.as_ref() {
            Some(pe) => tables::itemlist(pe),
            None => BTreeMap::new(),
        })
    }

    /// Classname to spawn-function bindings merged from every evidence
    /// source
    pub fn spawn_map(&self) -> &BTreeMap<String, String> {
        self.spawn_map.get_or_init(|| spawnmap::build(self))
    }

    /// The logged spawn-literal map keyed by classname
    pub fn logged_entries(&self) -> &BTreeMap<String, LoggedEntry> {
        self.logged.get_or_init(|| spawnmap::logged_entries(self))
    }

    /// The logged spawn-literal map as a list ordered by table index, then
    /// classname
    pub fn logged_entry_list(&self) -> Vec<LoggedEntry> {
        let mut entries: Vec<LoggedEntry> = self.logged_entries().values().cloned().collect();
        entries.sort_by(|a, b| (a.index, &a.classname).cmp(&(b.index, &b.classname)));
        entries
    }

    /// Decode the instruction window for a function start address
    fn disassemble(&self, address: u32) -> Vec<interp::Insn> {
        let Some(pe) = self.pe.as_ref() else {
            return Vec::new();
        };
        let mut stop = address.saturating_add(interp::MAX_FUNCTION_WINDOW);
        if let Some(next) = self.listing.next_function_start(address) {
            if next > address && next - address < interp::MAX_FUNCTION_WINDOW {
                stop = next;
            }
        }
        interp::disassemble(pe, address, stop)
    }

    /// Assemble the manifest for every known classname, ordered
    /// lexicographically
    pub fn build_manifest(&self) -> BTreeMap<String, ClassnameEntry> {
        let fields = self.listing.fields();
        let blocks = self.listing.function_blocks();
        let mut manifest = BTreeMap::new();
        for (classname, function) in self.spawn_map() {
            let mut entry = ClassnameEntry::new(function);
            if let Some(block) = blocks.get(function) {
                entry.has_block = true;
                entry.block_source = SourceTag::Hlil;
                entry.defaults = analysis::block_defaults(block, fields);
                if !entry.defaults.is_empty() {
                    entry.defaults_source = SourceTag::Hlil;
                }
                entry.spawnflags = if follows_helpers(classname) {
                    analysis::spawnflags_with_helpers(blocks, function)
                } else {
                    analysis::block_spawnflags(block)
                };
                if !entry.spawnflags.is_empty() {
                    entry.spawnflags_source = SourceTag::Hlil;
                }
            } else if let Some(address) = parse_sub_address(function) {
                let insns = self.disassemble(address);
                if !insns.is_empty() {
                    entry.has_block = true;
                    entry.block_source = SourceTag::Binary;
                    let effects = interp::analyze(&insns, self.pe.as_ref(), fields);
                    entry.spawnflags = effects.spawnflags;
                    if !entry.spawnflags.is_empty() {
                        entry.spawnflags_source = SourceTag::Binary;
                    }
                    entry.defaults = effects.defaults;
                    if !entry.defaults.is_empty() {
                        entry.defaults_source = SourceTag::Binary;
                    }
                }
            }
            if entry.defaults.is_empty() {
                if let Some(record) = self.itemlist().get(classname) {
                    let defaults = tables::item_defaults(record);
                    if !defaults.is_empty() {
                        entry.defaults = defaults;
                        entry.defaults_source = SourceTag::Itemlist;
                    }
                }
            }
            if entry.function == SPAWN_ITEM_SENTINEL && entry.block_source == SourceTag::None {
                entry.has_block = true;
                entry.block_source = SourceTag::Itemlist;
            }
            manifest.insert(classname.clone(), entry);
        }
        manifest
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_sub_address_parsing() {
        assert_eq!(parse_sub_address("sub_10001ac0"), Some(0x10001ac0));
        assert_eq!(parse_sub_address("SpawnItemFromItemlist"), None);
        assert_eq!(parse_sub_address("data_10001ac0"), None);
    }

    #[test]
    fn test_classname_normalization() {
        assert_eq!(normalize_classname(" weapon_rtdu\0\0"), "weapon_rtdu");
        assert_eq!(normalize_classname("func_door"), "func_door");
    }

    #[test]
    fn test_helper_prefixes() {
        assert!(follows_helpers("func_door"));
        assert!(follows_helpers("light"));
        assert!(!follows_helpers("light_mine"));
        assert!(!follows_helpers("monster_jorg"));
        assert!(!follows_helpers(""));
    }

    #[test]
    fn test_clear_recording_bounds() {
        let mut evidence = SpawnEvidence::default();
        evidence.record_clear(0xFFFF_FFFF, 0xFFFF_FFFF);
        assert!(evidence.clears.is_empty());
        evidence.record_clear(0, 0xFFFF_FFFF);
        assert!(evidence.clears.is_empty());
        evidence.record_clear(0xFFFF_FF7F, 0xFFFF_FFFF);
        assert_eq!(evidence.clears.iter().copied().collect::<Vec<_>>(), [0x80]);
    }
}
