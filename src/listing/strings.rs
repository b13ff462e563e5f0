//! Resolution of listing data labels and raw addresses to the string
//! literals declared at those slots, augmented by the optional interpreted
//! strings sidecar.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::compiled;

use super::Listing;

static STRING_DECL: LazyLock<Regex> = LazyLock::new(|| {
    compiled(
        r#"^(?:\d+:)?\s*100[0-9a-f]+\s+char \(\* (data_[0-9a-f]+)\)\[[^\]]+\] = (data_[0-9a-f]+) \{"([^"]+)"\}"#,
    )
});

#[derive(Debug, Clone, Default, Deserialize)]
/// One entry of the `interpreted/strings.json` sidecar
pub struct InterpretedString {
    #[serde(default)]
    /// The data label the string was recovered from
    pub symbol: Option<String>,
    #[serde(default)]
    /// The virtual address of the string
    pub address: Option<String>,
    #[serde(default)]
    /// The recovered string contents
    pub value: Option<String>,
    #[serde(default)]
    /// A classification tag such as `sound_path` or `weapon_descriptor`
    pub category: Option<String>,
}

/// Load `strings.json` from the interpreted sidecar directory. An absent or
/// malformed file yields an empty list.
pub(crate) fn load_interpreted_strings(dir: &Path) -> Vec<InterpretedString> {
    let path = dir.join("strings.json");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    match serde_json::from_str(&text) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("ignoring malformed {:?}: {}", path, e);
            Vec::new()
        }
    }
}

#[derive(Debug, Default)]
/// Lookup table from lowercase label/address keys to string literals
pub struct LiteralResolver {
    map: HashMap<String, String>,
}

impl LiteralResolver {
    /// Build the resolver from every string declaration in the listing plus
    /// the interpreted strings sidecar
    pub fn build(listing: &Listing) -> Self {
        let mut map = HashMap::new();
        for source in &listing.sources {
            for raw_line in &source.lines {
                let Some(caps) = STRING_DECL.captures(raw_line) else {
                    continue;
                };
                let (Some(label), Some(target), Some(name)) =
                    (caps.get(1), caps.get(2), caps.get(3))
                else {
                    continue;
                };
                for key in [label.as_str(), target.as_str()] {
                    map.insert(key.to_ascii_lowercase(), name.as_str().to_string());
                    if let Some(hex) = key.strip_prefix("data_") {
                        map.insert(
                            format!("0x{}", hex.to_ascii_lowercase()),
                            name.as_str().to_string(),
                        );
                    }
                }
            }
        }
        for entry in listing.interpreted_strings() {
            let Some(value) = entry.value.as_deref().filter(|v| !v.is_empty()) else {
                continue;
            };
            for key in [entry.symbol.as_deref(), entry.address.as_deref()] {
                if let Some(key) = key.filter(|k| !k.is_empty()) {
                    map.insert(key.to_ascii_lowercase(), value.to_string());
                }
            }
        }
        Self { map }
    }

    /// Look up a literal by an exact (case-folded) key
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.map.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Resolve a raw pointer value through its `data_XXXXXXXX` and
    /// `0xXXXXXXXX` spellings
    pub fn resolve_pointer(&self, pointer: u32) -> Option<&str> {
        for key in [format!("data_{pointer:08x}"), format!("0x{pointer:08x}")] {
            if let Some(value) = self.map.get(&key) {
                return Some(value);
            }
        }
        None
    }

    /// Resolve a table-entry token: a quoted literal stands for itself, a
    /// `&`-prefixed or bare label is looked up, and a hex address is retried
    /// through its `data_` spelling
    pub fn resolve_token<'a>(&'a self, raw: &'a str) -> Option<&'a str> {
        let token = raw.trim();
        if let Some(inner) = token
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
        {
            return Some(inner);
        }
        let token = token.strip_prefix('&').map(str::trim).unwrap_or(token);
        if let Some(value) = self.lookup(token) {
            return Some(value);
        }
        if let Some(hex) = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
        {
            if let Ok(address) = u32::from_str_radix(hex, 16) {
                return self.map.get(&format!("data_{address:08x}")).map(String::as_str);
            }
        }
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn listing_with(text: &str) -> (tempfile::TempDir, Listing) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.dll_hlil.txt");
        std::fs::write(&path, text).unwrap();
        let listing = Listing::open(&path).unwrap();
        (dir, listing)
    }

    #[test]
    fn test_declaration_keys() {
        let (_dir, listing) = listing_with(
            "10040020  char (* data_10040020)[0xd] = data_10040200 {\"monster_jorg\"}\n",
        );
        let resolver = LiteralResolver::build(&listing);
        assert_eq!(resolver.lookup("data_10040020"), Some("monster_jorg"));
        assert_eq!(resolver.lookup("DATA_10040200"), Some("monster_jorg"));
        assert_eq!(resolver.lookup("0x10040200"), Some("monster_jorg"));
        assert_eq!(resolver.resolve_pointer(0x10040020), Some("monster_jorg"));
    }

    #[test]
    fn test_token_resolution() {
        let (_dir, listing) = listing_with(
            "10040020  char (* data_10040020)[0xd] = data_10040200 {\"weapon_rtdu\"}\n",
        );
        let resolver = LiteralResolver::build(&listing);
        assert_eq!(resolver.resolve_token("\"func_door\""), Some("func_door"));
        assert_eq!(resolver.resolve_token("&data_10040020"), Some("weapon_rtdu"));
        assert_eq!(resolver.resolve_token("0x10040200"), Some("weapon_rtdu"));
        assert_eq!(resolver.resolve_token("0x12345678"), None);
    }

    #[test]
    fn test_sidecar_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.dll_hlil.txt");
        std::fs::write(&path, "").unwrap();
        let interpreted = dir.path().join("interpreted");
        std::fs::create_dir(&interpreted).unwrap();
        std::fs::write(
            interpreted.join("strings.json"),
            r#"[{"symbol": "data_10047000", "address": "0x10047000", "value": "weapon_rtdu", "category": "weapon_descriptor"}]"#,
        )
        .unwrap();

        let listing = Listing::open(&path).unwrap();
        let resolver = LiteralResolver::build(&listing);
        assert_eq!(resolver.lookup("data_10047000"), Some("weapon_rtdu"));
        assert_eq!(resolver.resolve_pointer(0x10047000), Some("weapon_rtdu"));
    }
}
