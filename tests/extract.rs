//! End-to-end extraction over a synthetic listing, image, sidecar, and
//! repo fixture.

use std::path::Path;

use spawn_manifest::manifest::SourceTag;
use spawn_manifest::{run, Options};

const IMAGE_BASE: u32 = 0x1000_0000;
const TEXT_RVA: u32 = 0x1000;
const DATA_RVA: u32 = 0x4_0000;
// The itemlist shares the spawn table base address 0x10046928.
const ITEMLIST_OFFSET: u32 = 0x1004_6928 - IMAGE_BASE - DATA_RVA;

/// Render a two-section PE32 image around the given section contents.
fn build_image(text: &[u8], data: &[u8]) -> Vec<u8> {
    let e_lfanew = 0x80usize;
    let optional_size = 0xE0usize;
    let text_raw = 0x400usize;
    let data_raw = (text_raw + text.len() + 0x1FF) & !0x1FF;
    let mut out = vec![0u8; data_raw + data.len()];

    out[0] = b'M';
    out[1] = b'Z';
    out[0x3C..0x40].copy_from_slice(&(e_lfanew as u32).to_le_bytes());
    out[e_lfanew..e_lfanew + 4].copy_from_slice(b"PE\0\0");
    out[e_lfanew + 6..e_lfanew + 8].copy_from_slice(&2u16.to_le_bytes());
    out[e_lfanew + 20..e_lfanew + 22].copy_from_slice(&(optional_size as u16).to_le_bytes());
    let optional = e_lfanew + 24;
    out[optional + 28..optional + 32].copy_from_slice(&IMAGE_BASE.to_le_bytes());

    let mut entry = optional + optional_size;
    let mut section = |out: &mut Vec<u8>, name: &[u8], rva: u32, size: u32, raw: u32| {
        out[entry..entry + name.len()].copy_from_slice(name);
        out[entry + 8..entry + 12].copy_from_slice(&size.to_le_bytes());
        out[entry + 12..entry + 16].copy_from_slice(&rva.to_le_bytes());
        out[entry + 16..entry + 20].copy_from_slice(&size.to_le_bytes());
        out[entry + 20..entry + 24].copy_from_slice(&raw.to_le_bytes());
        out[entry + 36..entry + 40].copy_from_slice(&0x6000_0020u32.to_le_bytes());
        entry += 40;
    };
    section(&mut out, b".text", TEXT_RVA, text.len() as u32, text_raw as u32);
    section(&mut out, b".data", DATA_RVA, data.len() as u32, data_raw as u32);

    out[text_raw..text_raw + text.len()].copy_from_slice(text);
    out[data_raw..data_raw + data.len()].copy_from_slice(data);
    out
}

/// The machine-code body of `sub_10001000`: load the entity pointer from
/// the stack, then assign, clear, and set spawnflag bits.
fn gladiator_code() -> Vec<u8> {
    let mut code = Vec::new();
    code.extend_from_slice(&[0x8B, 0x44, 0x24, 0x08]); // mov eax, [esp+8]
    code.extend_from_slice(&[0xC7, 0x80, 0x1C, 0x01, 0x00, 0x00, 0x42, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&[0x81, 0xA0, 0x1C, 0x01, 0x00, 0x00, 0x7F, 0xFF, 0xFF, 0xFF]);
    code.extend_from_slice(&[0x81, 0x88, 0x1C, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]);
    code.push(0xC3);
    code
}

fn build_data() -> Vec<u8> {
    let mut data = vec![0u8; ITEMLIST_OFFSET as usize + 2 * 0x48];
    let classname_va = IMAGE_BASE + DATA_RVA;
    data[..12].copy_from_slice(b"weapon_rtdu\0");

    let item_start = ITEMLIST_OFFSET as usize;
    // word 0: classname pointer; word 1: a data pointer (not a spawn
    // function); word 5: ammo quantity.
    data[item_start..item_start + 4].copy_from_slice(&classname_va.to_le_bytes());
    data[item_start + 4..item_start + 8].copy_from_slice(&classname_va.to_le_bytes());
    data[item_start + 20..item_start + 24].copy_from_slice(&25u32.to_le_bytes());
    data
}

const LISTING: &str = concat!(
    "10040020  char (* data_10040020)[0x12] = data_10040100 {\"monster_gladiator\"}\n",
    "10040024  void* data_10040024 = sub_10001000\n",
    "10040030  char (* data_10040030)[0x5] = data_10040200 {\"wait\"}\n",
    "10040034  20 01 00 00 01 00 00 00 00 00 00 00\n",
    "\n",
    "10002000  void sub_10002000(void* arg1)\n",
    "    *(arg1 + 0x120) = 0x40400000\n",
    "    *(arg1 + 0x11c) = 8\n",
    "\n",
    "10003000  void* sub_10003000(char* arg1, int32_t arg2)\n",
    "    {\"func_wall\", sub_10002000},\n",
    "    switch (arg2)\n",
    "        case 3:\n",
    "            if (sub_10038b20(arg1, \"monster_jorg\") == 0)\n",
    "                return sub_10001ac0\n",
);

const STRINGS_JSON: &str = r#"[
  {"symbol": "data_10046928", "address": "0x10046928", "value": "weapon_rtdu", "category": "weapon_descriptor"},
  {"symbol": "data_10040040", "address": "0x10040040", "value": "misc/w_pkup.wav", "category": "sound_path"}
]"#;

const G_SPAWN: &str = concat!(
    "spawn_t spawns[] = {\n",
    "\t{\"func_wall\", SP_func_wall},\n",
    "\t{\"monster_gladiator\", SP_monster_gladiator},\n",
    "\t{\"monster_jorg\", SP_monster_jorg},\n",
    "\t{\"monster_sentinel\", SP_monster_sentinel},\n",
    "\t{NULL, NULL}\n",
    "};\n",
);

const G_ITEMS: &str = concat!(
    "gitem_t itemlist[] = {\n",
    "\t{\n",
    "\t\t\"weapon_rtdu\",\n",
    "\t\tPickup_Weapon,\n",
    "\t},\n",
    "};\n",
);

const G_MONSTER: &str = concat!(
    "void SP_func_wall (edict_t *ent)\n",
    "{\n",
    "\tent->wait = 3.0f;\n",
    "\tent->spawnflags = 8;\n",
    "}\n",
    "void SP_monster_gladiator (edict_t *self)\n",
    "{\n",
    "\tself->spawnflags &= 0xffffff7f;\n",
    "}\n",
    "void SP_monster_jorg (edict_t *self)\n",
    "{\n",
    "\tself->health = 3000;\n",
    "}\n",
    "void SP_monster_sentinel (edict_t *self)\n",
    "{\n",
    "\tself->health = 500;\n",
    "}\n",
);

fn write_fixture(root: &Path) -> Options {
    let listing_dir = root.join("references");
    std::fs::create_dir_all(&listing_dir).unwrap();
    let listing_path = listing_dir.join("gamex86.dll_hlil.txt");
    std::fs::write(&listing_path, LISTING).unwrap();
    std::fs::write(
        listing_dir.join("gamex86.dll"),
        build_image(&gladiator_code(), &build_data()),
    )
    .unwrap();
    let interpreted = listing_dir.join("interpreted");
    std::fs::create_dir_all(&interpreted).unwrap();
    std::fs::write(interpreted.join("strings.json"), STRINGS_JSON).unwrap();

    let repo_root = root.join("repo");
    let game = repo_root.join("src").join("game");
    std::fs::create_dir_all(&game).unwrap();
    std::fs::write(game.join("g_spawn.c"), G_SPAWN).unwrap();
    std::fs::write(game.join("g_items.c"), G_ITEMS).unwrap();
    std::fs::write(game.join("g_monster.c"), G_MONSTER).unwrap();

    Options::builder().hlil(listing_path).repo(repo_root).build()
}

#[test]
fn test_listing_block_entry() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&write_fixture(dir.path())).unwrap();

    let wall = &output.combined.hlil["func_wall"];
    assert_eq!(wall.function, "sub_10002000");
    assert_eq!(wall.block_source, SourceTag::Hlil);
    assert_eq!(wall.defaults_source, SourceTag::Hlil);
    assert_eq!(wall.spawnflags_source, SourceTag::Hlil);
    assert_eq!(
        wall.spawnflags.assignments.iter().copied().collect::<Vec<_>>(),
        [8]
    );
    let wait = &wall.defaults["wait"];
    assert_eq!(wait.len(), 1);
    assert_eq!(wait[0].offset, 0x120);
    assert_eq!(wait[0].value.as_f64(), 3.0);
}

#[test]
fn test_binary_block_entry() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&write_fixture(dir.path())).unwrap();

    let gladiator = &output.combined.hlil["monster_gladiator"];
    assert_eq!(gladiator.function, "sub_10001000");
    assert_eq!(gladiator.block_source, SourceTag::Binary);
    assert_eq!(gladiator.spawnflags_source, SourceTag::Binary);
    let sf = &gladiator.spawnflags;
    assert_eq!(sf.assignments.iter().copied().collect::<Vec<_>>(), [0x42]);
    assert_eq!(sf.clears.iter().copied().collect::<Vec<_>>(), [0x80]);
    assert_eq!(sf.sets.iter().copied().collect::<Vec<_>>(), [0x100]);

    // The gladiator's clear matches the repo's; assignments and sets do
    // not, so a spawnflag diff is reported for it.
    let diff = &output.comparison.spawnflag_mismatches["monster_gladiator"];
    assert!(diff.contains_key("assignments"));
    assert!(diff.contains_key("sets"));
    assert!(!diff.contains_key("clears"));
}

#[test]
fn test_dispatch_chain_entry_without_block() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&write_fixture(dir.path())).unwrap();

    let jorg = &output.combined.hlil["monster_jorg"];
    assert_eq!(jorg.function, "sub_10001ac0");
    assert_eq!(jorg.block_source, SourceTag::None);
    assert!(output
        .comparison
        .hlil_missing_blocks
        .contains(&"monster_jorg".to_string()));
}

#[test]
fn test_itemlist_entry() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&write_fixture(dir.path())).unwrap();

    let rtdu = &output.combined.hlil["weapon_rtdu"];
    assert_eq!(rtdu.function, "SpawnItemFromItemlist");
    assert_eq!(rtdu.block_source, SourceTag::Itemlist);
    assert_eq!(rtdu.defaults_source, SourceTag::Itemlist);
    assert_eq!(rtdu.defaults.len(), 18);
    assert_eq!(
        rtdu.defaults["offset_0x0"][0].value.as_f64(),
        f64::from(IMAGE_BASE + DATA_RVA)
    );
    assert_eq!(rtdu.defaults["offset_0x14"][0].value.as_f64(), 25.0);

    let rendered = serde_json::to_string(rtdu).unwrap();
    assert!(rendered.contains("\"block_source\":\"itemlist\""));
    assert!(rendered.contains("\"function\":\"SpawnItemFromItemlist\""));
}

#[test]
fn test_feature_gate_suppresses_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = write_fixture(dir.path());

    let default_output = run(&options).unwrap();
    assert!(default_output.combined.repo.contains_key("monster_sentinel"));
    assert!(default_output
        .comparison
        .missing_in_hlil
        .contains(&"monster_sentinel".to_string()));

    options.defines = vec![(
        "OBLIVION_ENABLE_MONSTER_SENTINEL".to_string(),
        "0".to_string(),
    )];
    let gated_output = run(&options).unwrap();
    assert!(!gated_output.combined.repo.contains_key("monster_sentinel"));
    assert!(!gated_output
        .comparison
        .missing_in_hlil
        .contains(&"monster_sentinel".to_string()));
}

#[test]
fn test_default_mismatch_for_unmatched_field() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&write_fixture(dir.path())).unwrap();

    // The listing records the raw spawnflags slot as a default; the repo
    // names no such field, while the matching wait value stays quiet.
    let diff = &output.comparison.default_mismatches["func_wall"];
    assert!(diff.contains_key("offset_0x11c"));
    assert!(!diff.contains_key("wait"));
}

#[test]
fn test_output_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let options = write_fixture(dir.path());

    let first = run(&options).unwrap();
    let second = run(&options).unwrap();
    assert_eq!(
        serde_json::to_string(&first.combined).unwrap(),
        serde_json::to_string(&second.combined).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&first.comparison).unwrap(),
        serde_json::to_string(&second.comparison).unwrap()
    );

    // Manifest iteration is lexicographic by classname.
    let names: Vec<&String> = first.combined.hlil.keys().collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[test]
fn test_missing_image_degrades_to_listing_only() {
    let dir = tempfile::tempdir().unwrap();
    let options = write_fixture(dir.path());
    std::fs::remove_file(dir.path().join("references").join("gamex86.dll")).unwrap();

    let output = run(&options).unwrap();
    // Listing evidence survives; image-backed entries disappear or lose
    // their binary blocks.
    assert!(output.combined.hlil.contains_key("func_wall"));
    assert!(!output.combined.hlil.contains_key("weapon_rtdu"));
    let gladiator = &output.combined.hlil["monster_gladiator"];
    assert_eq!(gladiator.block_source, SourceTag::None);
}
