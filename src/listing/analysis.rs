//! Analysis over function line blocks: default-field assignments, spawnflag
//! bit operations (direct and through lexical aliases), dispatch-chain
//! walking, and helper-callee merging.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

use crate::compiled;
use crate::listing::{match_function_decl, FieldDescriptor, FunctionBlocks};
use crate::manifest::{normalize_classname, DefaultValue, SpawnEvidence, Value};

static IL_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    compiled(r"(?i)\*\((?:[a-z0-9_]+ \+ )?0x([0-9a-f]+)\) = (0x[0-9a-f]+|-?\d+)")
});
static ALIAS_BIND: LazyLock<Regex> = LazyLock::new(|| {
    compiled(r"(?i)([A-Za-z_][\w.:]*)\s*=\s*(?:\(\*[^)]*0x11c[^)]*\)(?:\.\w+)?|\*[^;]*0x11c[^;]*)")
});
static DIRECT_CHECK: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)\([^)]*0x11c[^)]*\)\s*&\s*(0x[0-9a-f]+|\d+)"));
static DIRECT_ASSIGN: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)\*\([^)]*0x11c[^)]*\)\s*=\s*(0x[0-9a-f]+|\d+)"));
static DIRECT_CLEAR: LazyLock<Regex> = LazyLock::new(|| {
    compiled(r"(?i)\*\([^)]*0x11c[^)]*\)\s*=\s*\*\([^)]*0x11c[^)]*\)\s*&\s*(0x[0-9a-f]+|\d+)")
});
static DIRECT_OR: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)\|=\s*(0x[0-9a-f]+|\d+)"));
static DIRECT_OR_ASSIGN: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)=\s*[^;]*\|\s*(0x[0-9a-f]+|\d+)"));
static DIRECT_AND: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)&=\s*(0x[0-9a-f]+|\d+)"));
static ALIAS_OP: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)([A-Za-z_][\w.:]*)\s*(\|=|&=)\s*(0x[0-9a-f]+|\d+)"));
static ALIAS_CHECK: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)([A-Za-z_][\w.:]*)\s*&\s*(0x[0-9a-f]+|\d+)"));
static REVERSE_ALIAS_CHECK: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)(0x[0-9a-f]+|\d+)\s*&\s*([A-Za-z_][\w.:]*)"));
static GOTO: LazyLock<Regex> = LazyLock::new(|| compiled(r"(?i)goto\s+(label_[0-9a-f]+)"));
static RETURN_SUB: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)return\s+(sub_[0-9a-f]+)\b"));
static LABEL: LazyLock<Regex> = LazyLock::new(|| compiled(r"(?i)(label_[0-9a-f]+):"));
static CASE_LINE: LazyLock<Regex> = LazyLock::new(|| compiled(r"(?i)\b(case|default)\b"));
static STRCMP_CALL: LazyLock<Regex> =
    LazyLock::new(|| compiled(r#"(?i)sub_10038b20\([^,]+,\s*"([^"]+)"\)"#));
static CHAR_PTR_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    compiled(r#"(?:const\s+)?char(?:\s+const)?\s*\*\s+[^=]+\s*=\s*"([^"]+)""#)
});
static INLINE_TABLE_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    compiled(r#"(?i)\{\s*((?:&\s*)?data_[0-9a-f]+|0x[0-9a-f]+|"[^"]+")\s*,\s*(sub_[0-9a-f]+)\s*\}"#)
});
static SUB_CALL_SITE: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(?i)\b(sub_[0-9a-f]+)\s*\("));

fn parse_mask(token: &str) -> Option<u32> {
    let value = if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        token.parse::<u64>().ok()?
    };
    Some(value as u32)
}

/// Extract default-field writes of the form `*(x + 0xOFF) = literal` from a
/// listing block. Offsets below `0x100` and offsets without a descriptor use
/// a synthetic `offset_0x..` name; float-typed fields decode the raw bits.
pub fn block_defaults(
    block: &[String],
    fields: &BTreeMap<u32, FieldDescriptor>,
) -> BTreeMap<String, Vec<DefaultValue>> {
    let mut results: BTreeMap<String, Vec<DefaultValue>> = BTreeMap::new();
    for line in block {
        for caps in IL_ASSIGN.captures_iter(line) {
            let (Some(offset_raw), Some(value_raw)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let Ok(offset) = u32::from_str_radix(offset_raw.as_str(), 16) else {
                continue;
            };
            let raw = value_raw.as_str();
            let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))
            {
                i64::from_str_radix(hex, 16).ok()
            } else {
                raw.parse::<i64>().ok()
            };
            let Some(int_value) = parsed else { continue };
            let field = fields.get(&offset).filter(|_| offset >= 0x100);
            let (name, value) = match field {
                Some(descriptor) if descriptor.is_float() => (
                    descriptor.name.clone(),
                    Value::Float(f32::from_bits(int_value as u32) as f64),
                ),
                Some(descriptor) => (descriptor.name.clone(), Value::Int(int_value)),
                None => (format!("offset_0x{offset:x}"), Value::Int(int_value)),
            };
            results
                .entry(name)
                .or_default()
                .push(DefaultValue { offset, value });
        }
    }
    results
}

fn strip_alias_suffix(name: &str) -> &str {
    let base = name.split(':').next().unwrap_or(name);
    base.split('.').next().unwrap_or(base)
}

/// Extract spawnflag evidence from a listing block. Operations on the field
/// at `0x11C` count directly; an `alias = *(x + 0x11C)` binding makes the
/// alias's later `|=`, `&=` and `&` operations count as well.
pub fn block_spawnflags(block: &[String]) -> SpawnEvidence {
    let mut evidence = SpawnEvidence::default();
    let mut aliases: HashSet<String> = HashSet::new();

    for line in block {
        if !line.contains("0x11c") {
            continue;
        }
        if !(line.contains("==") || line.contains("!=")) {
            for caps in ALIAS_BIND.captures_iter(line) {
                if let Some(lhs) = caps.get(1) {
                    aliases.insert(strip_alias_suffix(lhs.as_str()).to_string());
                }
            }
        }
        if let Some(mask) = DIRECT_ASSIGN
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| parse_mask(m.as_str()))
        {
            evidence.assignments.insert(mask);
        }
        for caps in DIRECT_OR.captures_iter(line) {
            if let Some(mask) = caps.get(1).and_then(|m| parse_mask(m.as_str())) {
                evidence.sets.insert(mask);
            }
        }
        if !line.contains("|=") {
            for caps in DIRECT_OR_ASSIGN.captures_iter(line) {
                if let Some(mask) = caps.get(1).and_then(|m| parse_mask(m.as_str())) {
                    evidence.sets.insert(mask);
                }
            }
        }
        for caps in DIRECT_AND.captures_iter(line) {
            if let Some(mask) = caps.get(1).and_then(|m| parse_mask(m.as_str())) {
                evidence.record_clear(mask, 0xFFFF_FFFF);
            }
        }
        if let Some(mask) = DIRECT_CLEAR
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| parse_mask(m.as_str()))
        {
            evidence.record_clear(mask, 0xFFFF_FFFF);
        }
        for caps in DIRECT_CHECK.captures_iter(line) {
            if let Some(mask) = caps.get(1).and_then(|m| parse_mask(m.as_str())) {
                evidence.checks.insert(mask);
            }
        }
    }

    for line in block {
        for caps in ALIAS_OP.captures_iter(line) {
            let (Some(alias), Some(op), Some(mask_raw)) = (caps.get(1), caps.get(2), caps.get(3))
            else {
                continue;
            };
            if !aliases.contains(strip_alias_suffix(alias.as_str())) {
                continue;
            }
            let Some(mask) = parse_mask(mask_raw.as_str()) else {
                continue;
            };
            if op.as_str() == "|=" {
                evidence.sets.insert(mask);
            } else {
                evidence.record_clear(mask, 0xFFFF_FFFF);
            }
        }
        for caps in ALIAS_CHECK.captures_iter(line) {
            let (Some(alias), Some(mask_raw)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            if !aliases.contains(strip_alias_suffix(alias.as_str())) {
                continue;
            }
            if let Some(mask) = parse_mask(mask_raw.as_str()) {
                evidence.checks.insert(mask);
            }
        }
        for caps in REVERSE_ALIAS_CHECK.captures_iter(line) {
            let (Some(mask_raw), Some(alias)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            if !aliases.contains(strip_alias_suffix(alias.as_str())) {
                continue;
            }
            if let Some(mask) = parse_mask(mask_raw.as_str()) {
                evidence.checks.insert(mask);
            }
        }
    }

    evidence
}

/// Direct `sub_XXXX(` call targets in a block, excluding declaration lines
pub(crate) fn direct_sub_calls(block: &[String]) -> BTreeSet<String> {
    let mut calls = BTreeSet::new();
    for line in block {
        if match_function_decl(line).is_some() {
            continue;
        }
        for caps in SUB_CALL_SITE.captures_iter(line) {
            if let Some(name) = caps.get(1) {
                calls.insert(name.as_str().to_string());
            }
        }
    }
    calls
}

/// Collect spawnflag evidence for a function and its direct callees to depth
/// 2, descending only into callees that touch the spawnflags offset
pub fn spawnflags_with_helpers(blocks: &FunctionBlocks, function: &str) -> SpawnEvidence {
    fn walk(
        blocks: &FunctionBlocks,
        name: &str,
        depth: usize,
        visited: &mut HashSet<String>,
        merged: &mut SpawnEvidence,
    ) {
        if !visited.insert(name.to_string()) {
            return;
        }
        let Some(block) = blocks.get(name) else {
            return;
        };
        merged.merge(&block_spawnflags(block));
        if depth >= 2 {
            return;
        }
        for callee in direct_sub_calls(block) {
            if visited.contains(&callee) {
                continue;
            }
            let Some(callee_block) = blocks.get(&callee) else {
                continue;
            };
            if !callee_block.iter().any(|line| line.contains("0x11c")) {
                continue;
            }
            walk(blocks, &callee, depth + 1, visited, merged);
        }
    }

    let mut merged = SpawnEvidence::default();
    let mut visited = HashSet::new();
    walk(blocks, function, 0, &mut visited, &mut merged);
    merged
}

/// A small insertion-ordered map used for per-block dispatch results
#[derive(Debug, Default)]
pub(crate) struct OrderedEntries {
    order: Vec<String>,
    map: HashMap<String, String>,
}

impl OrderedEntries {
    /// Insert keeping the first binding for a key
    pub(crate) fn insert_first(&mut self, key: String, value: String) {
        if !self.map.contains_key(&key) {
            self.order.push(key.clone());
            self.map.insert(key, value);
        }
    }

    /// Insert keeping the last binding for a key (the key's position stays
    /// at its first occurrence)
    pub(crate) fn insert_last(&mut self, key: String, value: String) {
        if !self.map.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.map.insert(key, value);
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .filter_map(|key| Some((key.as_str(), self.map.get(key)?.as_str())))
    }
}

/// Raw inline table entries `{token, sub_XXXX}` found in a block, in scan
/// order; tokens are unresolved
pub(crate) fn inline_table_entries(block: &[String]) -> Vec<(String, String)> {
    let text = block.join("\n");
    INLINE_TABLE_ENTRY
        .captures_iter(&text)
        .filter_map(|caps| {
            Some((
                caps.get(1)?.as_str().trim().to_string(),
                caps.get(2)?.as_str().to_string(),
            ))
        })
        .collect()
}

fn label_indices(block: &[String]) -> HashMap<String, usize> {
    let mut labels = HashMap::new();
    for (idx, line) in block.iter().enumerate() {
        if let Some(caps) = LABEL.captures(line) {
            if let Some(label) = caps.get(1) {
                labels.entry(label.as_str().to_string()).or_insert(idx);
            }
        }
    }
    labels
}

/// Walk forward from `start` looking for `return sub_XXXX`, following
/// `goto label_XXXX` edges breadth-first. The initial walk is bounded by
/// `search_limit`; continuations from labels run to the end of the block.
fn resolve_dispatch_chain(
    block: &[String],
    start: usize,
    search_limit: usize,
    labels: &HashMap<String, usize>,
) -> Option<String> {
    if block.is_empty() {
        return None;
    }
    let mut queue = VecDeque::new();
    queue.push_back(start);
    let mut visited: HashSet<usize> = HashSet::new();

    while let Some(current) = queue.pop_front() {
        if current >= block.len() || !visited.insert(current) {
            continue;
        }
        let end = if current == start {
            search_limit.min(block.len())
        } else {
            block.len()
        };
        for line in &block[current.min(block.len())..end] {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(caps) = RETURN_SUB.captures(line) {
                if let Some(func) = caps.get(1) {
                    return Some(func.as_str().to_string());
                }
            }
            for caps in GOTO.captures_iter(line) {
                if let Some(target) = caps.get(1).and_then(|m| labels.get(m.as_str())) {
                    if !visited.contains(target) {
                        queue.push_back(*target);
                    }
                }
            }
        }
    }
    None
}

/// Dispatch entries recovered from `strcmp` comparisons inside a `switch`:
/// every `sub_10038b20(*, "literal")` call within a case span starts a chain
/// walk for that literal. `skip` suppresses literals already bound.
pub(crate) fn switch_dispatch_entries(
    block: &[String],
    skip: &OrderedEntries,
) -> Vec<(String, String)> {
    if !block.iter().any(|line| line.contains("switch (")) {
        return Vec::new();
    }
    let labels = label_indices(block);
    let mut case_indices: Vec<usize> = block
        .iter()
        .enumerate()
        .filter(|(_, line)| CASE_LINE.is_match(line))
        .map(|(idx, _)| idx)
        .collect();
    if case_indices.is_empty() {
        return Vec::new();
    }
    case_indices.push(block.len());

    let mut results = Vec::new();
    let mut bound: HashSet<String> = HashSet::new();
    for window in case_indices.windows(2) {
        let (start, end) = (window[0], window[1]);
        for idx in start..end.min(block.len()) {
            for caps in STRCMP_CALL.captures_iter(&block[idx]) {
                let Some(literal) = caps.get(1) else { continue };
                let classname = normalize_classname(literal.as_str());
                if skip.contains(&classname) || bound.contains(&classname) {
                    continue;
                }
                if let Some(target) = resolve_dispatch_chain(block, idx + 1, end, &labels) {
                    bound.insert(classname.clone());
                    results.push((classname, target));
                }
            }
        }
    }
    results
}

/// Dispatch entries recovered from `char* name = "literal"` comparisons:
/// each literal's chain walk is bounded by the next literal's position for
/// the initial scan. Later bindings for the same literal win.
pub(crate) fn literal_dispatch_entries(block: &[String]) -> OrderedEntries {
    let labels = label_indices(block);
    let positions: Vec<(usize, String)> = block
        .iter()
        .enumerate()
        .filter_map(|(idx, line)| {
            CHAR_PTR_LITERAL
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| (idx, m.as_str().to_string()))
        })
        .collect();

    let mut results = OrderedEntries::default();
    for (pos, (line_idx, literal)) in positions.iter().enumerate() {
        let search_limit = positions
            .get(pos + 1)
            .map(|(idx, _)| *idx)
            .unwrap_or(block.len());
        let classname = normalize_classname(literal);
        if let Some(target) = resolve_dispatch_chain(block, line_idx + 1, search_limit, &labels) {
            results.insert_last(classname, target);
        }
    }
    results
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|s| s.to_string()).collect()
    }

    fn field(name: &str, offset: u32, type_id: u32) -> FieldDescriptor {
        FieldDescriptor {
            name: name.to_string(),
            offset,
            type_id,
            flags: 0,
        }
    }

    #[test]
    fn test_block_defaults_field_naming() {
        let mut fields = BTreeMap::new();
        fields.insert(0x120, field("wait", 0x120, 1));
        fields.insert(0x130, field("count", 0x130, 0));
        fields.insert(0x40, field("early", 0x40, 0));
        let block = lines(&[
            "*(arg1 + 0x120) = 0x40400000",
            "*(arg1 + 0x130) = 3",
            "*(arg1 + 0x40) = 7",
            "*(arg1 + 0x200) = -2",
        ]);
        let defaults = block_defaults(&block, &fields);
        assert_eq!(
            defaults["wait"],
            vec![DefaultValue {
                offset: 0x120,
                value: Value::Float(3.0),
            }]
        );
        assert_eq!(
            defaults["count"],
            vec![DefaultValue {
                offset: 0x130,
                value: Value::Int(3),
            }]
        );
        // Offsets below 0x100 keep the synthetic name even when a
        // descriptor exists.
        assert_eq!(
            defaults["offset_0x40"],
            vec![DefaultValue {
                offset: 0x40,
                value: Value::Int(7),
            }]
        );
        assert_eq!(
            defaults["offset_0x200"],
            vec![DefaultValue {
                offset: 0x200,
                value: Value::Int(-2),
            }]
        );
    }

    #[test]
    fn test_direct_spawnflag_operations() {
        let block = lines(&[
            "*(arg1 + 0x11c) = 8",
            "*(arg1 + 0x11c) = *(arg1 + 0x11c) & 0xfffffffe",
            "if ((*(arg1 + 0x11c) & 4) != 0)",
        ]);
        let evidence = block_spawnflags(&block);
        assert_eq!(evidence.assignments.iter().copied().collect::<Vec<_>>(), [8]);
        assert_eq!(evidence.clears.iter().copied().collect::<Vec<_>>(), [1]);
        assert!(evidence.checks.contains(&4));
    }

    #[test]
    fn test_alias_spawnflag_operations() {
        let block = lines(&[
            "int32_t flags = *(arg1 + 0x11c)",
            "flags |= 0x10",
            "flags &= 0xffffffdf",
            "if ((flags & 2) != 0)",
            "if ((8 & flags) != 0)",
            "other |= 0x100",
        ]);
        let evidence = block_spawnflags(&block);
        assert_eq!(evidence.sets.iter().copied().collect::<Vec<_>>(), [0x10]);
        assert_eq!(evidence.clears.iter().copied().collect::<Vec<_>>(), [0x20]);
        assert!(evidence.checks.contains(&2));
        assert!(evidence.checks.contains(&8));
        // `other` was never bound to the spawnflags field.
        assert!(!evidence.sets.contains(&0x100));
    }

    #[test]
    fn test_alias_binding_skips_comparisons() {
        let block = lines(&[
            "if (done == *(arg1 + 0x11c))",
            "done |= 0x40",
        ]);
        let evidence = block_spawnflags(&block);
        assert!(evidence.sets.is_empty());
    }

    #[test]
    fn test_helper_merge_depth() {
        let mut blocks = FunctionBlocks::default();
        blocks.append(
            "sub_10002000",
            vec![
                "10002000  void sub_10002000(void* arg1)".to_string(),
                "sub_10002100(arg1)".to_string(),
            ],
        );
        blocks.append(
            "sub_10002100",
            vec![
                "10002100  void sub_10002100(void* arg1)".to_string(),
                "*(arg1 + 0x11c) = *(arg1 + 0x11c) & 0xfffffffb".to_string(),
                "sub_10002200(arg1)".to_string(),
            ],
        );
        blocks.append(
            "sub_10002200",
            vec![
                "10002200  void sub_10002200(void* arg1)".to_string(),
                "int32_t flags = *(arg1 + 0x11c)".to_string(),
                "flags |= 0x200".to_string(),
            ],
        );
        let evidence = spawnflags_with_helpers(&blocks, "sub_10002000");
        assert_eq!(evidence.clears.iter().copied().collect::<Vec<_>>(), [4]);
        assert_eq!(evidence.sets.iter().copied().collect::<Vec<_>>(), [0x200]);
    }

    #[test]
    fn test_inline_table_entries() {
        let block = lines(&[
            "    {&data_10040020, sub_10001ac0},",
            "    {0x10040200, sub_10001bc0},",
            "    {\"func_wall\", sub_10001cc0},",
        ]);
        let entries = inline_table_entries(&block);
        assert_eq!(
            entries,
            vec![
                ("&data_10040020".to_string(), "sub_10001ac0".to_string()),
                ("0x10040200".to_string(), "sub_10001bc0".to_string()),
                ("\"func_wall\"".to_string(), "sub_10001cc0".to_string()),
            ]
        );
    }

    #[test]
    fn test_switch_dispatch_follows_gotos() {
        let block = lines(&[
            "10003000  void* sub_10003000(char* arg1)",
            "switch (eax)",
            "case 3:",
            "if (sub_10038b20(arg1, \"monster_jorg\") == 0)",
            "goto label_10003080",
            "case 4:",
            "if (sub_10038b20(arg1, \"monster_kigrax\") == 0)",
            "return sub_10001bc0",
            "label_10003080:",
            "return sub_10001ac0",
        ]);
        let entries = switch_dispatch_entries(&block, &OrderedEntries::default());
        assert_eq!(
            entries,
            vec![
                ("monster_jorg".to_string(), "sub_10001ac0".to_string()),
                ("monster_kigrax".to_string(), "sub_10001bc0".to_string()),
            ]
        );
    }

    #[test]
    fn test_literal_dispatch_is_span_bounded() {
        let block = lines(&[
            "10003000  void* sub_10003000(char* arg1)",
            "char* name = \"target_speaker\"",
            "goto label_10003090",
            "char* other = \"target_help\"",
            "return sub_10001dc0",
            "label_10003090:",
            "return sub_10001ec0",
        ]);
        let entries = literal_dispatch_entries(&block);
        let bound: Vec<(String, String)> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        // The first literal reaches its return through the label; the
        // second finds the return inside its own span.
        assert_eq!(
            bound,
            vec![
                ("target_speaker".to_string(), "sub_10001ec0".to_string()),
                ("target_help".to_string(), "sub_10001dc0".to_string()),
            ]
        );
    }
}
