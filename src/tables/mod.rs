//! Fixed-layout tables in the image's data section: the spawn registration
//! table and the item table that shares its base address.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::compiled;
use crate::listing::strings::LiteralResolver;
use crate::manifest::{normalize_classname, DefaultMap, DefaultValue, Value};
use crate::pe::PeImage;

/// Base virtual address of the primary spawn table and the item table
pub const SPAWN_TABLE_VA: u32 = 0x1004_6928;
/// Base virtual address of the auxiliary name/function pair table
pub const AUX_SPAWN_TABLE_VA: u32 = 0x1004_A5C0;
/// Record size of the primary table and the item table
pub const SPAWN_RECORD_SIZE: usize = 0x48;
/// Record size of the auxiliary pair table
pub const PAIR_RECORD_SIZE: usize = 8;
/// Consecutive empty or invalid records that end a table scan once at least
/// one valid record was seen
const INVALID_STREAK_LIMIT: usize = 64;
/// Offset of the text-label pointer inside a spawn record
const TEXT_LABEL_OFFSET: usize = 0x28;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| compiled(r"^[A-Za-z][A-Za-z0-9_]*$"));

/// The raw words of one item table record
pub type ItemRecord = [u32; SPAWN_RECORD_SIZE / 4];

#[derive(Debug, Clone, Serialize)]
/// One classname/function pair recovered from the spawn registration table
pub struct SpawnRecord {
    /// Virtual address of the pair inside the table
    pub address: u32,
    /// The normalized classname
    pub classname: String,
    /// The spawn function as a `sub_XXXXXXXX` symbol
    pub function: String,
    /// Raw function pointer value
    pub function_pointer: u32,
    /// Record index within the table
    pub index: usize,
    /// Raw classname pointer value
    pub name_pointer: u32,
    /// Offset of the pair within its record
    pub pair_offset: usize,
    /// The record's text label, when its pointer resolves
    pub text_label: Option<String>,
    /// Raw text-label pointer value
    pub text_pointer: u32,
}

fn record_words(pe: &PeImage, file_offset: usize, index: usize) -> Option<ItemRecord> {
    let data = pe.data();
    let start = file_offset + index * SPAWN_RECORD_SIZE;
    let chunk = data.get(start..start + SPAWN_RECORD_SIZE)?;
    let mut words = [0u32; SPAWN_RECORD_SIZE / 4];
    for (word, bytes) in words.iter_mut().zip(chunk.chunks_exact(4)) {
        *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Some(words)
}

fn classname_at(pe: &PeImage, resolver: &LiteralResolver, pointer: u32) -> Option<String> {
    resolver
        .resolve_pointer(pointer)
        .map(str::to_string)
        .or_else(|| pe.read_cstring(pointer))
        .filter(|name| !name.is_empty())
}

/// Parse the spawn registration table: 0x48-byte records each holding nine
/// name/function pairs and a text-label pointer. The scan ends after 64
/// consecutive fruitless records once at least one pair was recorded.
pub fn spawn_table_records(pe: &PeImage, resolver: &LiteralResolver) -> Vec<SpawnRecord> {
    let mut records = Vec::new();
    let Some(file_offset) = pe.va_to_file_offset(SPAWN_TABLE_VA) else {
        return records;
    };
    let mut index = 0usize;
    let mut invalid_streak = 0usize;
    while let Some(words) = record_words(pe, file_offset, index) {
        if words.iter().all(|w| *w == 0) {
            invalid_streak += 1;
            if invalid_streak >= INVALID_STREAK_LIMIT && !records.is_empty() {
                break;
            }
            index += 1;
            continue;
        }

        let text_pointer = words[TEXT_LABEL_OFFSET / 4];
        let text_label = if text_pointer != 0 {
            pe.read_cstring(text_pointer)
        } else {
            None
        };

        let before = records.len();
        for pair in 0..SPAWN_RECORD_SIZE / PAIR_RECORD_SIZE {
            let name_pointer = words[pair * 2];
            let function_pointer = words[pair * 2 + 1];
            if name_pointer == 0 || function_pointer == 0 {
                continue;
            }
            if !pe.is_in_text(function_pointer) {
                continue;
            }
            let Some(raw_name) = classname_at(pe, resolver, name_pointer) else {
                continue;
            };
            let classname = normalize_classname(&raw_name);
            if !IDENTIFIER.is_match(&classname) {
                continue;
            }
            records.push(SpawnRecord {
                address: SPAWN_TABLE_VA + (index * SPAWN_RECORD_SIZE + pair * PAIR_RECORD_SIZE) as u32,
                classname,
                function: format!("sub_{function_pointer:08x}"),
                function_pointer,
                index,
                name_pointer,
                pair_offset: pair * PAIR_RECORD_SIZE,
                text_label: text_label.clone(),
                text_pointer,
            });
        }
        invalid_streak = if records.len() > before {
            0
        } else {
            invalid_streak + 1
        };
        index += 1;
    }
    log::debug!("spawn table yielded {} pairs", records.len());
    records
}

/// Read a sequential name/function pair table at `base`, keeping the first
/// binding per classname. The scan tolerates invalid rows until 64 occur in
/// a row after the first valid one.
pub fn read_pair_table(
    pe: &PeImage,
    resolver: &LiteralResolver,
    base: u32,
    entry_size: usize,
) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::new();
    let Some(mut offset) = pe.va_to_file_offset(base) else {
        return entries;
    };
    let data = pe.data();
    let mut seen_valid = 0usize;
    let mut invalid_streak = 0usize;
    while offset + entry_size <= data.len() {
        let name_pointer = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        let function_pointer = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let classname = classname_at(pe, resolver, name_pointer);
        let valid = classname
            .as_deref()
            .map(|name| pe.is_in_text(function_pointer) && !name.is_empty())
            .unwrap_or(false);
        if !valid {
            if seen_valid > 0 {
                invalid_streak += 1;
                if invalid_streak >= INVALID_STREAK_LIMIT {
                    break;
                }
            }
            offset += entry_size;
            continue;
        }
        invalid_streak = 0;
        seen_valid += 1;
        if let Some(name) = classname {
            let normalized = normalize_classname(&name);
            if !entries.iter().any(|(existing, _)| *existing == normalized) {
                entries.push((normalized, format!("sub_{function_pointer:08x}")));
            }
        }
        offset += entry_size;
    }
    entries
}

/// Parse the item table that shares the spawn table's base address. The scan
/// stops at the first all-zero record after index 0; a later duplicate
/// classname replaces the earlier record.
pub fn itemlist(pe: &PeImage) -> BTreeMap<String, ItemRecord> {
    let mut entries = BTreeMap::new();
    let Some(file_offset) = pe.va_to_file_offset(SPAWN_TABLE_VA) else {
        return entries;
    };
    let mut index = 0usize;
    while let Some(words) = record_words(pe, file_offset, index) {
        if words.iter().all(|w| *w == 0) {
            if index != 0 {
                break;
            }
            index += 1;
            continue;
        }
        if let Some(classname) = pe.read_cstring(words[0]) {
            entries.insert(normalize_classname(&classname), words);
        }
        index += 1;
    }
    entries
}

/// Expand an item record into raw defaults: word `i` becomes the synthetic
/// field `offset_0x<4i>`
pub fn item_defaults(record: &ItemRecord) -> DefaultMap {
    let mut defaults = DefaultMap::new();
    for (idx, word) in record.iter().enumerate() {
        let offset = (idx * 4) as u32;
        defaults.insert(
            format!("offset_0x{offset:x}"),
            vec![DefaultValue {
                offset,
                value: Value::Int(*word as i64),
            }],
        );
    }
    defaults
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::testutil::TestImage;

    fn build_table_image(rows: &[[u32; 18]]) -> PeImage {
        let mut image = TestImage::new();
        image.push_text(&[0xC3; 0x40]);
        let mut bytes = Vec::new();
        for row in rows {
            for word in row {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
        image.write_data_at(SPAWN_TABLE_VA, &bytes);
        image.build()
    }

    fn empty_resolver() -> LiteralResolver {
        LiteralResolver::default()
    }

    #[test]
    fn test_spawn_records_and_termination() {
        let mut image = TestImage::new();
        let func = image.push_text(&[0xC3; 0x10]);
        let name = image.push_data(b"monster_jorg\0");
        let text = image.push_data(b"Jorg\0");
        let bad_name = image.push_data(b"not a classname\0");

        let mut row = [0u32; 18];
        row[0] = name;
        row[1] = func;
        row[2] = bad_name;
        row[3] = func;
        row[TEXT_LABEL_OFFSET / 4] = text;
        let mut bytes = Vec::new();
        for word in row {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        // One populated record followed by empty space: the streak rule
        // ends the scan without recording anything else.
        bytes.extend_from_slice(&[0u8; SPAWN_RECORD_SIZE * 70]);
        image.write_data_at(SPAWN_TABLE_VA, &bytes);
        let pe = image.build();

        let records = spawn_table_records(&pe, &empty_resolver());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].classname, "monster_jorg");
        assert_eq!(records[0].function, format!("sub_{func:08x}"));
        assert_eq!(records[0].text_label.as_deref(), Some("Jorg"));
        assert_eq!(records[0].pair_offset, 0);
    }

    #[test]
    fn test_pair_table_first_binding_wins() {
        let mut image = TestImage::new();
        let func_a = image.push_text(&[0x90; 8]);
        let func_b = image.push_text(&[0x90; 8]);
        let name = image.push_data(b"func_door\0");

        let mut bytes = Vec::new();
        for (n, f) in [(name, func_a), (name, func_b)] {
            bytes.extend_from_slice(&n.to_le_bytes());
            bytes.extend_from_slice(&f.to_le_bytes());
        }
        image.write_data_at(AUX_SPAWN_TABLE_VA, &bytes);
        let pe = image.build();

        let entries = read_pair_table(&pe, &empty_resolver(), AUX_SPAWN_TABLE_VA, PAIR_RECORD_SIZE);
        assert_eq!(
            entries,
            vec![("func_door".to_string(), format!("sub_{func_a:08x}"))]
        );
    }

    #[test]
    fn test_itemlist_stops_at_first_gap() {
        let mut image = TestImage::new();
        let name_a = image.push_data(b"weapon_rtdu\0");
        let name_b = image.push_data(b"ammo_mines\0");

        let mut first = [0u32; 18];
        first[0] = name_a;
        first[5] = 25;
        let gap = [0u32; 18];
        let mut after_gap = [0u32; 18];
        after_gap[0] = name_b;
        let pe = build_table_image(&[first, gap, after_gap]);

        let items = itemlist(&pe);
        assert_eq!(items.len(), 1);
        let record = items.get("weapon_rtdu").unwrap();
        assert_eq!(record[5], 25);

        let defaults = item_defaults(record);
        assert_eq!(
            defaults["offset_0x14"],
            vec![DefaultValue {
                offset: 0x14,
                value: Value::Int(25),
            }]
        );
        assert_eq!(defaults.len(), 18);
    }

    #[test]
    fn test_itemlist_skips_leading_empty_record() {
        let mut image = TestImage::new();
        let name = image.push_data(b"key_data_cd\0");
        let empty = [0u32; 18];
        let mut second = [0u32; 18];
        second[0] = name;
        // An all-zero record at index 0 does not terminate the scan.
        let mut rows = vec![empty, second];
        rows.push(empty);
        let pe = build_table_image(&rows);
        let items = itemlist(&pe);
        assert_eq!(items.len(), 1);
        assert!(items.contains_key("key_data_cd"));
    }
}
