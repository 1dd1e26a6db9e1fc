mod fixtures;

use fixtures::*;

use qcn::loader::{load_input, LoadOptions};
use qcn::master;
use qcn::model::DecodedValue;
use qcn::qcn::{read_qcn, write_qcn, WriterOptions, NV_PACKET_SIZE};
use qcn::schema::{Catalog, SchemaOptions};
use qcn::transform::{build_snapshot, TransformOptions};
use tempfile::tempdir;

fn compile_sample() -> (tempfile::TempDir, std::path::PathBuf, Catalog) {
    ensure_env_logger_initialized();
    let dir = tempdir().unwrap();
    let (schema_path, master_path) = write_sample_files(dir.path());

    let catalog = Catalog::from_path(&schema_path, &SchemaOptions::default()).unwrap();
    let master = master::load_master(&master_path).unwrap();
    let snapshot = build_snapshot(&catalog, master, &TransformOptions::default());

    let qcn_path = dir.path().join("out.qcn");
    write_qcn(&snapshot, &qcn_path, &WriterOptions::default()).unwrap();
    (dir, qcn_path, catalog)
}

#[test]
fn xml_compiles_and_reads_back() {
    let (_dir, qcn_path, catalog) = compile_sample();
    let snapshot = load_input(&qcn_path, &catalog, &LoadOptions::default()).unwrap();

    // Numbered payload marshalled little-endian, index defaulted to 1.
    let band_pref = &snapshot.numbered[&946];
    assert_eq!(band_pref.index, 1);
    assert_eq!(
        band_pref.data.as_deref().map(|d| &d[..6]),
        Some(&[0x57, 0x04, 0x02, 0x00, 0xe3, 0x27][..])
    );
    assert_eq!(band_pref.params[0].val, DecodedValue::Ints(vec![132183]));
    assert_eq!(band_pref.params[1].val, DecodedValue::Ints(vec![10211]));

    // The commaless uint8 run came back as ASCII.
    let apn = &snapshot.numbered[&6828];
    assert_eq!(apn.data.as_deref().map(|d| &d[..3]), Some(&b"ims"[..]));
    assert_eq!(apn.params[0].val, DecodedValue::Text("ims".to_owned()));
}

#[test]
fn every_efs_item_lands_in_exactly_one_store() {
    let (_dir, qcn_path, catalog) = compile_sample();
    let snapshot = load_input(&qcn_path, &catalog, &LoadOptions::default()).unwrap();

    let mut seen = Vec::new();
    for (_, store) in snapshot.stores() {
        for value in store.values() {
            assert!(
                !seen.contains(&value.path),
                "{} appears in more than one store",
                value.path
            );
            seen.push(value.path.clone());
        }
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(snapshot.provisioning.len(), 1);
    assert_eq!(snapshot.backup.len(), 1);
    assert_eq!(snapshot.nv_items.len(), 1);
}

#[test]
fn packets_are_exactly_one_stride() {
    let (_dir, qcn_path, _catalog) = compile_sample();

    let mut comp = cfb::open(&qcn_path).unwrap();
    let mut bytes = Vec::new();
    use std::io::Read;
    comp.open_stream("/00000000/default/NV_NUMBERED_ITEMS/NV_ITEM_ARRAY")
        .unwrap()
        .read_to_end(&mut bytes)
        .unwrap();
    assert_eq!(bytes.len() % NV_PACKET_SIZE, 0);
    assert_eq!(bytes.len() / NV_PACKET_SIZE, 2);
}

#[test]
fn second_read_equals_first() {
    let (_dir, qcn_path, _catalog) = compile_sample();
    let first = read_qcn(&qcn_path).unwrap();
    let second = read_qcn(&qcn_path).unwrap();
    assert_eq!(first, second);
}

#[test]
fn backup_round_trip_restores_the_path() {
    let (_dir, qcn_path, catalog) = compile_sample();
    let snapshot = load_input(&qcn_path, &catalog, &LoadOptions::default()).unwrap();
    let backup = snapshot.backup.values().next().unwrap();
    assert_eq!(backup.path, "/nv/item_files/rfnv/00020000");
    assert_eq!(backup.data.as_deref(), Some(&[1, 0, 2, 0, 3, 0, 4, 0][..]));
}
