//! Indexing of the decompiler listing text: the primary file plus every
//! continuation under its `split/` directory, carved into per-function line
//! blocks with the data declarations that describe the entity structure.

pub mod analysis;
pub mod strings;

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::{compiled, pe};

use strings::InterpretedString;

static DECL_LINE: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)^(?:\d+:)?\s*100[0-9a-f]+\s+(.+)$"));
static SUB_CALL: LazyLock<Regex> = LazyLock::new(|| compiled(r"(?i)\b(sub_[0-9a-f]+)\s*\("));
static TYPE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    compiled(r"(?i)\b(?:void|char|short|int|long|float|double|qboolean|size_t|uint\d+_t|int\d+_t)\b")
});
static FIELD_DECL: LazyLock<Regex> = LazyLock::new(|| {
    compiled(
        r#"^(?:\d+:)?\s*100[0-9a-f]+\s+char \(\* (data_[0-9a-f]+)\)\[[^\]]+\] = (data_[0-9a-f]+) \{"([^"]+)"\}"#,
    )
});
static FUNC_PTR_DECL: LazyLock<Regex> = LazyLock::new(|| {
    compiled(r"^(?:\d+:)?\s*100[0-9a-f]+\s+void\* (data_[0-9a-f]+) = (sub_[0-9a-f]+)")
});
static HEX_RUN: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)[0-9a-f]{2}\s+[0-9a-f]{2}\s+[0-9a-f]{2}"));
static HEX_BYTE: LazyLock<Regex> = LazyLock::new(|| compiled(r"(?i)\b[0-9a-f]{2}\b"));
static BLOCK_ADDR: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)^(?:\d+:)?\s*(100[0-9a-f]+)\s"));
static LOGGED_CALL: LazyLock<Regex> =
    LazyLock::new(|| compiled(r#"(?i)sub_1000b150\("([^"]+)"\)"#));

/// Recognize a function declaration line and return the declared symbol.
///
/// A declaration carries a `100XXXXX` listing address, a return-type prefix
/// built from C primitive tokens, and a `sub_XXXX(` head. Assignments,
/// returns, and nested calls in the prefix disqualify the line.
pub(crate) fn match_function_decl(raw_line: &str) -> Option<String> {
    let rest = DECL_LINE.captures(raw_line)?.get(1)?.as_str();
    let sub = SUB_CALL.find(rest)?;
    let prefix = &rest[..sub.start()];
    if prefix.trim().is_empty() {
        return None;
    }
    if prefix.contains('=') || prefix.contains("return") || prefix.contains('(') {
        return None;
    }
    if !TYPE_TOKEN.is_match(prefix) {
        return None;
    }
    let name = SUB_CALL.captures(rest)?.get(1)?.as_str();
    Some(name.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One field of the entity structure, unpacked from a 12-byte descriptor
/// record in the listing
pub struct FieldDescriptor {
    /// The field name from the preceding string declaration
    pub name: String,
    /// Byte offset of the field inside the entity structure
    pub offset: u32,
    /// Type marker; `1` denotes a 32-bit float field
    pub type_id: u32,
    /// Raw descriptor flags
    pub flags: u32,
}

impl FieldDescriptor {
    /// Whether the descriptor marks a 32-bit float field
    pub fn is_float(&self) -> bool {
        self.type_id == 1
    }
}

#[derive(Debug, Default)]
/// Function line blocks keyed by symbol, preserving the order in which each
/// symbol was first declared across all sources
pub struct FunctionBlocks {
    order: Vec<String>,
    map: HashMap<String, Vec<String>>,
    seen: HashMap<String, HashSet<String>>,
}

impl FunctionBlocks {
    fn append(&mut self, name: &str, lines: Vec<String>) {
        if !self.map.contains_key(name) {
            self.order.push(name.to_string());
            self.map.insert(name.to_string(), Vec::new());
            self.seen.insert(name.to_string(), HashSet::new());
        }
        let block = self.map.entry(name.to_string()).or_default();
        let seen = self.seen.entry(name.to_string()).or_default();
        for line in lines {
            if seen.insert(line.clone()) {
                block.push(line);
            }
        }
    }

    /// Look up the merged block for a symbol
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.map.get(name).map(Vec::as_slice)
    }

    /// Iterate blocks in first-declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.order
            .iter()
            .filter_map(|name| Some((name.as_str(), self.map.get(name)?.as_slice())))
    }

    /// Number of distinct symbols
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no blocks were found
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug)]
struct SourceFile {
    rel_path: String,
    lines: Vec<String>,
    is_split: bool,
}

#[derive(Debug)]
/// The concatenated listing sources with lazily built indexes
pub struct Listing {
    path: PathBuf,
    sources: Vec<SourceFile>,
    image_path: Option<PathBuf>,
    blocks: OnceCell<FunctionBlocks>,
    fields: OnceCell<BTreeMap<u32, FieldDescriptor>>,
    direct_pairs: OnceCell<Vec<(String, String)>>,
    starts: OnceCell<(HashMap<String, u32>, Vec<u32>)>,
    interpreted: OnceCell<Vec<InterpretedString>>,
    logged_literals: OnceCell<BTreeMap<String, BTreeSet<String>>>,
}

impl Listing {
    /// Read the primary listing and every `*.txt` continuation under its
    /// sibling `split/` directory. Only the primary file is required.
    pub fn open(path: &Path) -> Result<Self> {
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let split_root = root.join("split");

        let mut sources = Vec::new();
        let primary = std::fs::read_to_string(path).map_err(|e| Error::io(path, &e))?;
        sources.push(SourceFile {
            rel_path: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            lines: primary.lines().map(str::to_string).collect(),
            is_split: false,
        });

        let mut continuations = Vec::new();
        collect_txt_files(&split_root, &mut continuations);
        continuations.sort();
        for extra in continuations {
            let text = match std::fs::read_to_string(&extra) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("skipping unreadable continuation {:?}: {}", extra, e);
                    continue;
                }
            };
            let rel_path = extra
                .strip_prefix(&root)
                .unwrap_or(&extra)
                .to_string_lossy()
                .replace('\\', "/");
            sources.push(SourceFile {
                rel_path,
                lines: text.lines().map(str::to_string).collect(),
                is_split: true,
            });
        }

        Ok(Self {
            image_path: pe::image_path_for_listing(path),
            path: path.to_path_buf(),
            sources,
            blocks: OnceCell::new(),
            fields: OnceCell::new(),
            direct_pairs: OnceCell::new(),
            starts: OnceCell::new(),
            interpreted: OnceCell::new(),
            logged_literals: OnceCell::new(),
        })
    }

    /// The primary listing path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The image file next to the listing, when one exists
    pub fn image_path(&self) -> Option<&Path> {
        self.image_path.as_deref()
    }

    /// The sibling `interpreted/` sidecar directory
    pub fn interpreted_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
            .join("interpreted")
    }

    /// Per-function line blocks, merged across primary and continuation
    /// sources with identical lines deduplicated
    pub fn function_blocks(&self) -> &FunctionBlocks {
        self.blocks.get_or_init(|| {
            let mut blocks = FunctionBlocks::default();
            for source in &self.sources {
                let mut current: Option<(String, Vec<String>)> = None;
                for raw_line in &source.lines {
                    if let Some(decl) = match_function_decl(raw_line) {
                        if let Some((name, lines)) = current.take() {
                            blocks.append(&name, lines);
                        }
                        current = Some((decl, vec![raw_line.trim().to_string()]));
                    } else if let Some((_, lines)) = current.as_mut() {
                        lines.push(raw_line.trim().to_string());
                    }
                }
                if let Some((name, lines)) = current.take() {
                    blocks.append(&name, lines);
                }
            }
            log::debug!("indexed {} function blocks", blocks.len());
            blocks
        })
    }

    /// Entity field descriptors keyed by offset; the first descriptor seen
    /// for an offset wins
    pub fn fields(&self) -> &BTreeMap<u32, FieldDescriptor> {
        self.fields.get_or_init(|| {
            let mut entries = BTreeMap::new();
            for source in &self.sources {
                for (idx, raw_line) in source.lines.iter().enumerate() {
                    let Some(caps) = FIELD_DECL.captures(raw_line) else {
                        continue;
                    };
                    let Some(next_line) = next_non_empty(&source.lines, idx + 1) else {
                        continue;
                    };
                    if !HEX_RUN.is_match(next_line) {
                        continue;
                    }
                    let bytes = parse_hex_bytes(next_line);
                    if bytes.len() < 12 {
                        continue;
                    }
                    let offset = u32_le(&bytes[0..4]);
                    if entries.contains_key(&offset) {
                        continue;
                    }
                    let name = caps.get(3).map(|m| m.as_str().to_string());
                    let Some(name) = name else { continue };
                    entries.insert(
                        offset,
                        FieldDescriptor {
                            name,
                            offset,
                            type_id: u32_le(&bytes[4..8]),
                            flags: u32_le(&bytes[8..12]),
                        },
                    );
                }
            }
            entries
        })
    }

    /// Classname to spawn-function bindings read directly from paired data
    /// declarations, in listing order
    pub fn direct_pairs(&self) -> &[(String, String)] {
        self.direct_pairs.get_or_init(|| {
            let mut pairs: Vec<(String, String)> = Vec::new();
            let mut claimed: HashSet<String> = HashSet::new();
            for source in &self.sources {
                for (idx, raw_line) in source.lines.iter().enumerate() {
                    let Some(caps) = FIELD_DECL.captures(raw_line) else {
                        continue;
                    };
                    let Some(classname) = caps.get(3).map(|m| m.as_str()) else {
                        continue;
                    };
                    if claimed.contains(classname) {
                        continue;
                    }
                    let Some(next_line) = next_non_empty(&source.lines, idx + 1) else {
                        continue;
                    };
                    if let Some(func) = FUNC_PTR_DECL
                        .captures(next_line)
                        .and_then(|c| c.get(2))
                        .map(|m| m.as_str().to_string())
                    {
                        claimed.insert(classname.to_string());
                        pairs.push((classname.to_string(), func));
                        continue;
                    }
                    if source.is_split {
                        if let Some(func) = find_next_function_decl(&source.lines, idx + 1) {
                            claimed.insert(classname.to_string());
                            pairs.push((classname.to_string(), func));
                        }
                    }
                }
            }
            pairs
        })
    }

    fn starts(&self) -> &(HashMap<String, u32>, Vec<u32>) {
        self.starts.get_or_init(|| {
            let mut map = HashMap::new();
            for (name, block) in self.function_blocks().iter() {
                let Some(first) = block.first() else { continue };
                let Some(addr) = BLOCK_ADDR
                    .captures(first)
                    .and_then(|c| c.get(1))
                    .and_then(|m| u32::from_str_radix(m.as_str(), 16).ok())
                else {
                    continue;
                };
                map.insert(name.to_string(), addr);
            }
            let mut sorted: Vec<u32> = map.values().copied().collect();
            sorted.sort_unstable();
            (map, sorted)
        })
    }

    /// The next known function start strictly above an address
    pub fn next_function_start(&self, address: u32) -> Option<u32> {
        let (_, sorted) = self.starts();
        let idx = sorted.partition_point(|start| *start <= address);
        sorted.get(idx).copied()
    }

    /// Interpreted string sidecar entries (empty when the file is absent or
    /// malformed)
    pub fn interpreted_strings(&self) -> &[InterpretedString] {
        self.interpreted
            .get_or_init(|| strings::load_interpreted_strings(&self.interpreted_dir()))
    }

    /// Literals passed to the spawn-logging helper `sub_1000b150`, each with
    /// the set of source files that contain the call
    pub fn logged_literals(&self) -> &BTreeMap<String, BTreeSet<String>> {
        self.logged_literals.get_or_init(|| {
            let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for source in &self.sources {
                for line in &source.lines {
                    for caps in LOGGED_CALL.captures_iter(line) {
                        if let Some(literal) = caps.get(1) {
                            out.entry(literal.as_str().to_string())
                                .or_default()
                                .insert(source.rel_path.clone());
                        }
                    }
                }
            }
            out
        })
    }
}

fn collect_txt_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_txt_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "txt") {
            out.push(path);
        }
    }
}

fn next_non_empty<'a>(lines: &'a [String], start: usize) -> Option<&'a str> {
    lines[start.min(lines.len())..]
        .iter()
        .map(String::as_str)
        .find(|line| !line.trim().is_empty())
}

fn find_next_function_decl(lines: &[String], start: usize) -> Option<String> {
    for line in &lines[start.min(lines.len())..] {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        if ["#", "//", "/*", "*", "*/"]
            .iter()
            .any(|lead| stripped.starts_with(lead))
        {
            continue;
        }
        if let Some(decl) = match_function_decl(line) {
            return Some(decl);
        }
    }
    None
}

fn parse_hex_bytes(line: &str) -> Vec<u8> {
    HEX_BYTE
        .find_iter(line)
        .take(12)
        .filter_map(|m| u8::from_str_radix(m.as_str(), 16).ok())
        .collect()
}

fn u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
