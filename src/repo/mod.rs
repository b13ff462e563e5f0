//! The C-source side of the comparison: spawn registrations, `SP_*` bodies,
//! numeric field defaults, and spawnflag usage parsed straight out of the
//! game sources.

pub mod macros;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::compiled;
use crate::error::{Error, Result};
use crate::manifest::{follows_helpers, SpawnEvidence, SPAWN_ITEM_SENTINEL};

use macros::MacroResolver;

static SPAWN_ARRAY_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| compiled(r#"\{\s*"([^"]+)",\s*(SP_[^}]+)\}"#));
static ITEMLIST_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"gitem_t\s+itemlist\s*\[\]\s*="));
static ITEM_CLASSNAME: LazyLock<Regex> = LazyLock::new(|| compiled(r#"\{\s*"([^"]+)"\s*,"#));
static SP_FUNCTION_DECL: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"^\w[\w\s*]*\b(SP_[a-zA-Z0-9_]+)\s*\(([^)]*)\)"));
static FIELD_ASSIGN: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"\b([a-zA-Z_][a-zA-Z0-9_]*)->([a-zA-Z0-9_.]+)\s*=\s*([^;]+)"));
static SPAWNFLAGS_CHECK: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"spawnflags\s*&\s*([^&|)]+)"));
static CALL_SITE: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\("));
static FUNCTION_DECL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    compiled(r"^\s*[A-Za-z_][\w\s*]*\b[A-Za-z_][A-Za-z0-9_]*\s*\([^;]*\)\s*(\{|$)")
});
static CAST_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"^\(\s*(?:const\s+)?(?:struct\s+)?[a-zA-Z_][\w\s*]*\)"));
static FLOAT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| compiled(r"(\d+\.\d+)[fF]\b"));
static INT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"(^|[^0-9a-fA-FxX])(\d+)[fF]\b"));

/// Keywords that look like call sites to the helper scanner
const CALL_BLACKLIST: [&str; 11] = [
    "if", "for", "while", "switch", "return", "sizeof", "do", "case", "goto", "break", "continue",
];
/// Door spawn functions union the spawnflag evidence of these helpers
const DOOR_HELPERS: [&str; 3] = [
    "Think_SpawnDoorTrigger",
    "Think_CalcMoveSpeed",
    "Door_ClearStartOpenFlag",
];
/// Classnames receiving the door-helper union
const DOOR_CLASSNAMES: [&str; 3] = ["func_door", "func_door_rotating", "func_door_secret"];

#[derive(Debug, Clone, Serialize)]
/// One classname's entry in the repo-side manifest
pub struct RepoEntry {
    /// Numeric field defaults assigned in the spawn function
    pub defaults: BTreeMap<String, f64>,
    /// The registered spawn function name
    pub function: String,
    /// Spawnflag evidence from the spawn function and its helpers
    pub spawnflags: SpawnEvidence,
}

/// Parser over the game sources beneath a repo root
pub struct RepoParser {
    sources: Vec<(PathBuf, String)>,
    resolver: MacroResolver,
    spawn_map: BTreeMap<String, String>,
    functions: HashMap<String, Vec<String>>,
    function_cache: RefCell<HashMap<String, Option<Vec<String>>>>,
}

impl RepoParser {
    /// Read `src/game/**/*.{c,h}` under the repo root. The spawn
    /// registration and item sources must exist.
    pub fn new(root: &Path, overrides: &[(String, String)]) -> Result<Self> {
        let game_dir = root.join("src").join("game");
        let mut paths = Vec::new();
        collect_sources(&game_dir, "c", &mut paths);
        let mut headers = Vec::new();
        collect_sources(&game_dir, "h", &mut headers);
        paths.extend(headers);

        let mut sources = Vec::new();
        for path in paths {
            match std::fs::read(&path) {
                Ok(bytes) => sources.push((path, String::from_utf8_lossy(&bytes).into_owned())),
                Err(e) => log::warn!("skipping unreadable source {:?}: {}", path, e),
            }
        }
        for required in ["g_spawn.c", "g_items.c"] {
            let path = game_dir.join(required);
            if !sources.iter().any(|(p, _)| *p == path) {
                return Err(Error::MissingGameSource { path });
            }
        }

        let resolver = MacroResolver::new(sources.iter().map(|(_, text)| text.as_str()), overrides);
        let mut parser = Self {
            sources,
            resolver,
            spawn_map: BTreeMap::new(),
            functions: HashMap::new(),
            function_cache: RefCell::new(HashMap::new()),
        };
        parser.spawn_map = parser.parse_spawn_map(&game_dir);
        parser.functions = parser.parse_sp_functions();
        Ok(parser)
    }

    /// The registered classname to spawn-function map
    pub fn spawn_map(&self) -> &BTreeMap<String, String> {
        &self.spawn_map
    }

    fn source_text(&self, game_dir: &Path, name: &str) -> Option<&str> {
        let path = game_dir.join(name);
        self.sources
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, text)| text.as_str())
    }

    fn parse_spawn_map(&self, game_dir: &Path) -> BTreeMap<String, String> {
        let mut spawn_map = BTreeMap::new();
        if let Some(text) = self.source_text(game_dir, "g_spawn.c") {
            for caps in SPAWN_ARRAY_ENTRY.captures_iter(text) {
                if let (Some(classname), Some(func)) = (caps.get(1), caps.get(2)) {
                    spawn_map.insert(
                        classname.as_str().to_string(),
                        func.as_str().trim().to_string(),
                    );
                }
            }
        }
        for classname in self.parse_itemlist_classnames(game_dir) {
            spawn_map
                .entry(classname)
                .or_insert_with(|| SPAWN_ITEM_SENTINEL.to_string());
        }
        if self.resolver.evaluate("OBLIVION_ENABLE_ROTATE_TRAIN") == Some(0) {
            spawn_map.remove("func_rotate_train");
        }
        if self.resolver.evaluate("OBLIVION_ENABLE_MONSTER_SENTINEL") == Some(0) {
            spawn_map.remove("monster_sentinel");
        }
        spawn_map
    }

    fn parse_itemlist_classnames(&self, game_dir: &Path) -> Vec<String> {
        let Some(text) = self.source_text(game_dir, "g_items.c") else {
            return Vec::new();
        };
        let Some(anchor) = ITEMLIST_ANCHOR.find(text) else {
            return Vec::new();
        };
        let Some(block) = braced_block(&text[anchor.end()..]) else {
            return Vec::new();
        };
        let mut classnames: HashSet<String> = ITEM_CLASSNAME
            .captures_iter(block)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .collect();
        if self.resolver.evaluate("OBLIVION_ENABLE_WEAPON_LASERCANNON") == Some(0) {
            classnames.remove("weapon_lasercannon");
        }
        let mut sorted: Vec<String> = classnames.into_iter().collect();
        sorted.sort();
        sorted
    }

    fn parse_sp_functions(&self) -> HashMap<String, Vec<String>> {
        let mut functions = HashMap::new();
        for (_, text) in &self.sources {
            let mut current: Option<(String, Vec<String>, usize)> = None;
            for line in text.lines() {
                match current.as_mut() {
                    None => {
                        let Some(caps) = SP_FUNCTION_DECL.captures(line) else {
                            continue;
                        };
                        if line.trim_end().ends_with(';') {
                            continue;
                        }
                        let Some(name) = caps.get(1) else { continue };
                        let depth = usize::from(line.contains('{'));
                        current = Some((name.as_str().to_string(), vec![line.to_string()], depth));
                    }
                    Some((name, lines, depth)) => {
                        lines.push(line.to_string());
                        *depth += line.matches('{').count();
                        for _ in line.matches('}') {
                            *depth = depth.saturating_sub(1);
                        }
                        if *depth == 0 && line.trim_end().ends_with('}') {
                            functions.insert(name.clone(), lines.clone());
                            current = None;
                        }
                    }
                }
            }
        }
        functions
    }

    /// Find any function body by name via brace counting; memoized
    fn function_lines(&self, name: &str) -> Option<Vec<String>> {
        if let Some(cached) = self.function_cache.borrow().get(name) {
            return cached.clone();
        }
        let pattern = compiled(&format!(
            r"^\w[\w\s*]*\b{}\s*\(([^)]*)\)",
            regex::escape(name)
        ));
        let mut found: Option<Vec<String>> = None;
        'sources: for (_, text) in &self.sources {
            let mut current: Option<(Vec<String>, usize)> = None;
            for line in text.lines() {
                match current.as_mut() {
                    None => {
                        if !pattern.is_match(line) || line.trim_end().ends_with(';') {
                            continue;
                        }
                        let depth = usize::from(line.contains('{'));
                        current = Some((vec![line.to_string()], depth));
                    }
                    Some((lines, depth)) => {
                        lines.push(line.to_string());
                        *depth += line.matches('{').count();
                        for _ in line.matches('}') {
                            *depth = depth.saturating_sub(1);
                        }
                        if *depth == 0 && line.trim_end().ends_with('}') {
                            found = Some(lines.clone());
                            break 'sources;
                        }
                    }
                }
            }
        }
        self.function_cache
            .borrow_mut()
            .insert(name.to_string(), found.clone());
        found
    }

    fn extract_defaults(&self, lines: &[String]) -> BTreeMap<String, f64> {
        let mut defaults = BTreeMap::new();
        for line in lines {
            for caps in FIELD_ASSIGN.captures_iter(line) {
                let (Some(field), Some(expr)) = (caps.get(2), caps.get(3)) else {
                    continue;
                };
                if let Some(value) = self.evaluate_default_expr(expr.as_str()) {
                    defaults.insert(field.as_str().to_string(), value);
                }
            }
        }
        defaults
    }

    fn evaluate_default_expr(&self, expr: &str) -> Option<f64> {
        let normalized = normalize_numeric_expr(expr);
        if normalized.is_empty() {
            return None;
        }
        if let Some(value) = self.resolver.eval_numeric(&normalized) {
            return Some(value);
        }
        self.parse_literal_or_macro(&normalized)
    }

    fn parse_literal_or_macro(&self, expr: &str) -> Option<f64> {
        let token = expr.trim();
        if token.is_empty() {
            return None;
        }
        if let Some(hex) = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
        {
            return u64::from_str_radix(hex, 16).ok().map(|v| v as f64);
        }
        if let Ok(value) = token.parse::<f64>() {
            return Some(value);
        }
        self.resolver.evaluate(token).map(|v| v as f64)
    }

    fn resolve_flag_token(&self, token: &str) -> Option<i64> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        if let Some(hex) = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
        {
            return i64::from_str_radix(hex, 16).ok();
        }
        if token.bytes().all(|b| b.is_ascii_digit()) {
            return token.parse().ok();
        }
        self.resolver.evaluate(token)
    }

    fn extract_spawnflags(&self, lines: &[String]) -> SpawnEvidence {
        let mut evidence = SpawnEvidence::default();
        for line in lines {
            if !line.contains("spawnflags") {
                continue;
            }
            if line.contains("|=") {
                let token = line
                    .rsplit("|=")
                    .next()
                    .and_then(|rest| rest.split(';').next());
                if let Some(value) = token.and_then(|t| self.resolve_flag_token(t)) {
                    evidence.sets.insert(value as u32);
                }
            }
            if line.contains("&=") {
                let token = line
                    .rsplit("&=")
                    .next()
                    .and_then(|rest| rest.split(';').next());
                if let Some(value) = token.and_then(|t| self.resolve_flag_token(t)) {
                    evidence.record_clear(value as u32, 0xFFFF_FFFF);
                }
            }
            if let Some(rest) = line.split_once("spawnflags =").map(|(_, rest)| rest) {
                let token = rest.split(';').next().unwrap_or(rest);
                if let Some(value) = self.resolve_flag_token(token) {
                    evidence.assignments.insert(value as u32);
                }
            }
            for caps in SPAWNFLAGS_CHECK.captures_iter(line) {
                if let Some(value) = caps
                    .get(1)
                    .and_then(|m| self.resolve_flag_token(m.as_str()))
                {
                    evidence.checks.insert(value as u32);
                }
            }
        }
        evidence
    }

    fn direct_helper_calls(&self, lines: &[String]) -> HashSet<String> {
        let mut calls = HashSet::new();
        for line in lines {
            if FUNCTION_DECL_LINE.is_match(line) || line.trim_start().starts_with('#') {
                continue;
            }
            for caps in CALL_SITE.captures_iter(line) {
                let Some(name) = caps.get(1) else { continue };
                if CALL_BLACKLIST.contains(&name.as_str()) {
                    continue;
                }
                if is_member_call(line, name.start()) {
                    continue;
                }
                calls.insert(name.as_str().to_string());
            }
        }
        calls
    }

    fn spawnflags_with_helpers(&self, function: &str) -> SpawnEvidence {
        let mut merged = SpawnEvidence::default();
        let mut visited = HashSet::new();
        self.walk_helpers(function, 0, &mut visited, &mut merged);
        merged
    }

    fn walk_helpers(
        &self,
        name: &str,
        depth: usize,
        visited: &mut HashSet<String>,
        merged: &mut SpawnEvidence,
    ) {
        if !visited.insert(name.to_string()) {
            return;
        }
        let Some(lines) = self.function_lines(name) else {
            return;
        };
        merged.merge(&self.extract_spawnflags(&lines));
        if depth >= 2 {
            return;
        }
        let mut callees: Vec<String> = self.direct_helper_calls(&lines).into_iter().collect();
        callees.sort();
        for callee in callees {
            if visited.contains(&callee) {
                continue;
            }
            let Some(callee_lines) = self.function_lines(&callee) else {
                continue;
            };
            if !callee_lines.iter().any(|line| line.contains("spawnflags")) {
                continue;
            }
            self.walk_helpers(&callee, depth + 1, visited, merged);
        }
    }

    /// Assemble the repo-side manifest, ordered lexicographically by
    /// classname
    pub fn build_manifest(&self) -> BTreeMap<String, RepoEntry> {
        let mut manifest = BTreeMap::new();
        for (classname, function) in &self.spawn_map {
            let mut entry = RepoEntry {
                defaults: BTreeMap::new(),
                function: function.clone(),
                spawnflags: SpawnEvidence::default(),
            };
            if let Some(lines) = self.functions.get(function) {
                entry.defaults = self.extract_defaults(lines);
                entry.spawnflags = if follows_helpers(classname) {
                    self.spawnflags_with_helpers(function)
                } else {
                    self.extract_spawnflags(lines)
                };
                if DOOR_CLASSNAMES.contains(&classname.as_str()) {
                    for helper in DOOR_HELPERS {
                        if let Some(helper_lines) = self.function_lines(helper) {
                            entry
                                .spawnflags
                                .merge(&self.extract_spawnflags(&helper_lines));
                        }
                    }
                }
            }
            manifest.insert(classname.clone(), entry);
        }
        manifest
    }
}

fn collect_sources(dir: &Path, extension: &str, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut found: Vec<PathBuf> = Vec::new();
    let mut subdirs: Vec<PathBuf> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.extension().is_some_and(|ext| ext == extension) {
            found.push(path);
        }
    }
    found.sort();
    subdirs.sort();
    out.extend(found);
    for subdir in subdirs {
        collect_sources(&subdir, extension, out);
    }
}

/// The brace-delimited block that starts at the first `{` in `text`,
/// exclusive of the outer braces' positions (the leading `{` is included)
fn braced_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (idx, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + idx]);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_member_call(line: &str, call_start: usize) -> bool {
    let head = &line.as_bytes()[..call_start];
    let mut idx = head.len();
    while idx > 0 && (head[idx - 1] as char).is_whitespace() {
        idx -= 1;
    }
    if idx == 0 {
        return false;
    }
    if head[idx - 1] == b'.' {
        return true;
    }
    idx >= 2 && &head[idx - 2..idx] == b"->"
}

fn normalize_numeric_expr(expr: &str) -> String {
    let mut expr = expr.trim().trim_end_matches(';').trim().to_string();
    loop {
        let Some(m) = CAST_PREFIX.find(&expr) else { break };
        expr = expr[m.end()..].trim_start().to_string();
    }
    let expr = FLOAT_SUFFIX.replace_all(&expr, "$1").into_owned();
    INT_SUFFIX.replace_all(&expr, "${1}${2}").into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn write_repo(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let game = dir.path().join("src").join("game");
        std::fs::create_dir_all(&game).unwrap();
        for (name, contents) in files {
            std::fs::write(game.join(name), contents).unwrap();
        }
        dir
    }

    const SPAWNS: &str = concat!(
        "spawn_t spawns[] = {\n",
        "\t{\"func_door\", SP_func_door},\n",
        "\t{\"monster_sentinel\", SP_monster_sentinel},\n",
        "\t{NULL, NULL}\n",
        "};\n",
    );

    const ITEMS: &str = concat!(
        "gitem_t itemlist[] = {\n",
        "\t{\n\t\t\"weapon_rtdu\",\n\t\tPickup_Weapon,\n\t},\n",
        "\t{\n\t\t\"ammo_mines\",\n\t\tPickup_Ammo,\n\t},\n",
        "};\n",
    );

    fn doors_source() -> &'static str {
        concat!(
            "#define DOOR_START_OPEN 1\n",
            "#define DOOR_CRUSHER 4\n",
            "void SP_func_door (edict_t *ent)\n",
            "{\n",
            "\tif (ent->spawnflags & DOOR_START_OPEN)\n",
            "\t\tDoor_ClearStartOpenFlag (ent);\n",
            "\tent->speed = 100;\n",
            "\tent->wait = 3.0f;\n",
            "\tent->dmg = 2;\n",
            "}\n",
            "void Door_ClearStartOpenFlag (edict_t *ent)\n",
            "{\n",
            "\tent->spawnflags &= 0xfffffffe;\n",
            "}\n",
            "void SP_monster_sentinel (edict_t *self)\n",
            "{\n",
            "\tself->spawnflags |= 8;\n",
            "}\n",
        )
    }

    #[test]
    fn test_spawn_map_and_itemlist() {
        let dir = write_repo(&[
            ("g_spawn.c", SPAWNS),
            ("g_items.c", ITEMS),
            ("g_func.c", doors_source()),
        ]);
        let parser = RepoParser::new(dir.path(), &[]).unwrap();
        let map = parser.spawn_map();
        assert_eq!(map["func_door"], "SP_func_door");
        assert_eq!(map["weapon_rtdu"], SPAWN_ITEM_SENTINEL);
        assert_eq!(map["ammo_mines"], SPAWN_ITEM_SENTINEL);
    }

    #[test]
    fn test_sentinel_feature_gate() {
        let dir = write_repo(&[
            ("g_spawn.c", SPAWNS),
            ("g_items.c", ITEMS),
            ("g_func.c", doors_source()),
        ]);
        let enabled = RepoParser::new(dir.path(), &[]).unwrap();
        assert!(enabled.spawn_map().contains_key("monster_sentinel"));

        let overrides = [(
            "OBLIVION_ENABLE_MONSTER_SENTINEL".to_string(),
            "0".to_string(),
        )];
        let disabled = RepoParser::new(dir.path(), &overrides).unwrap();
        assert!(!disabled.spawn_map().contains_key("monster_sentinel"));
    }

    #[test]
    fn test_defaults_and_macro_spawnflags() {
        let dir = write_repo(&[
            ("g_spawn.c", SPAWNS),
            ("g_items.c", ITEMS),
            ("g_func.c", doors_source()),
        ]);
        let parser = RepoParser::new(dir.path(), &[]).unwrap();
        let manifest = parser.build_manifest();
        let door = &manifest["func_door"];
        assert_eq!(door.defaults["speed"], 100.0);
        assert_eq!(door.defaults["wait"], 3.0);
        assert_eq!(door.defaults["dmg"], 2.0);
        assert!(door.spawnflags.checks.contains(&1));
        // The helper walk reaches Door_ClearStartOpenFlag, whose mask
        // clears bit 0.
        assert!(door.spawnflags.clears.contains(&1));

        let sentinel = &manifest["monster_sentinel"];
        assert_eq!(
            sentinel.spawnflags.sets.iter().copied().collect::<Vec<_>>(),
            [8]
        );
    }

    #[test]
    fn test_missing_game_sources_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RepoParser::new(dir.path(), &[]).is_err());
    }
}
