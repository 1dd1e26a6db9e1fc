#![allow(dead_code)]
use std::fs;
use std::path::{Path, PathBuf};

use std::sync::Once;

static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
pub fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}

pub const SAMPLE_SCHEMA: &str = r#"<NvDefinition>
  <NvItem id="946" name="band_pref">
    <Member name="band1" type="int32" sizeOf="1"/>
    <Member name="band2" type="int16" sizeOf="1"/>
  </NvItem>
  <NvItem id="6828" name="apn_name">
    <Member name="apn" type="uint8" sizeOf="30"/>
  </NvItem>
  <DataType name="cat_entry">
    <Member name="cat" type="uint8" sizeOf="1"/>
    <Member name="flags" type="uint16" sizeOf="1"/>
  </DataType>
  <NvEfsItem fullpathname="/nv/item_files/modem/lte/cat">
    <Member name="entry" type="cat_entry" sizeOf="1"/>
  </NvEfsItem>
  <NvEfsItem fullpathname="/nv/item_files/modem/prov">
    <Member name="x" type="uint16" sizeOf="1"/>
  </NvEfsItem>
  <NvItem id="20000">
    <Member name="chan" type="uint16" sizeOf="4"/>
  </NvItem>
</NvDefinition>
"#;

pub const SAMPLE_MASTER: &str = r#"<NvSource>
  <NvItem id="946" encoding="dec">132183, 10211</NvItem>
  <NvItem id="6828">ims</NvItem>
  <NvEfsItem fullpathname="/nv/item_files/modem/lte/cat">
    <cat>6</cat>
    <flags>0x20</flags>
  </NvEfsItem>
  <NvEfsItem fullpathname="/nv/item_files/modem/prov" useProvisioningStore="true">7</NvEfsItem>
  <NvItem id="20000">1, 2, 3, 4</NvItem>
</NvSource>
"#;

/// Writes the sample schema and master into `dir`, returning their paths.
pub fn write_sample_files(dir: &Path) -> (PathBuf, PathBuf) {
    let schema = dir.join("nv_definition.xml");
    let master = dir.join("nv_master.xml");
    fs::write(&schema, SAMPLE_SCHEMA).unwrap();
    fs::write(&master, SAMPLE_MASTER).unwrap();
    (schema, master)
}
