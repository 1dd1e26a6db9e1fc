mod fixtures;

use fixtures::*;

use assert_cmd::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn it_compiles_xml_to_qcn_and_prints_it_back() {
    let d = tempdir().unwrap();
    let (schema, master) = write_sample_files(d.path());
    let out = d.as_ref().join("out.qcn");

    let mut compile = Command::cargo_bin("qcn_tool").expect("failed to find binary");
    compile.args([
        "-s",
        &schema.to_string_lossy(),
        "-c",
        &master.to_string_lossy(),
        &out.to_string_lossy(),
    ]);
    assert!(compile.output().unwrap().status.success());
    assert!(fs::metadata(&out).unwrap().len() > 0);

    let mut print = Command::cargo_bin("qcn_tool").expect("failed to find binary");
    print.args(["-s", &schema.to_string_lossy(), "-p", &out.to_string_lossy()]);
    let output = print.output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("mobile phone number: 0"));
    assert!(stdout.contains("mobile sw version: "));
    assert!(stdout.contains("NV item 946 (band_pref):"));
    assert!(stdout.contains("band1: 132183"));
    assert!(stdout.contains("apn: ims"));
    assert!(stdout.contains("EFS item /nv/item_files/modem/lte/cat:"));
}

#[test]
fn it_rejects_compile_output_without_qcn_extension() {
    let d = tempdir().unwrap();
    let (schema, master) = write_sample_files(d.path());
    let out = d.as_ref().join("out.bin");

    let mut cmd = Command::cargo_bin("qcn_tool").expect("failed to find binary");
    cmd.args([
        "-s",
        &schema.to_string_lossy(),
        "-c",
        &master.to_string_lossy(),
        &out.to_string_lossy(),
    ]);
    let output = cmd.output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains(".qcn"));
}

#[test]
fn it_rejects_unknown_input_extensions() {
    let d = tempdir().unwrap();
    let (schema, _master) = write_sample_files(d.path());
    let stray = d.as_ref().join("input.bin");
    fs::write(&stray, b"not a container").unwrap();

    let mut cmd = Command::cargo_bin("qcn_tool").expect("failed to find binary");
    cmd.args(["-s", &schema.to_string_lossy(), "-p", &stray.to_string_lossy()]);
    let output = cmd.output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("expected .qcn, .xml or .mbn"));
}

#[test]
fn it_emits_an_update_script() {
    let d = tempdir().unwrap();
    let (schema, master) = write_sample_files(d.path());
    let script = d.as_ref().join("update.sh");

    let mut cmd = Command::cargo_bin("qcn_tool").expect("failed to find binary");
    cmd.args([
        "-s",
        &schema.to_string_lossy(),
        "-u",
        &master.to_string_lossy(),
        &script.to_string_lossy(),
    ]);
    assert!(cmd.output().unwrap().status.success());

    let text = fs::read_to_string(&script).unwrap();
    assert!(text.contains("nvimgr --item 946 6 \\"));
    assert!(text.contains("nvimgr --item /nv/item_files/modem/prov"));
}

#[cfg(not(target_os = "windows"))]
#[test]
fn diffing_a_qcn_against_itself_is_empty() {
    let d = tempdir().unwrap();
    let (schema, master) = write_sample_files(d.path());
    let out = d.as_ref().join("same.qcn");

    let mut compile = Command::cargo_bin("qcn_tool").expect("failed to find binary");
    compile.args([
        "-s",
        &schema.to_string_lossy(),
        "-c",
        &master.to_string_lossy(),
        &out.to_string_lossy(),
    ]);
    assert!(compile.output().unwrap().status.success());

    let mut diff = Command::cargo_bin("qcn_tool").expect("failed to find binary");
    diff.args([
        "-s",
        &schema.to_string_lossy(),
        "-d",
        &out.to_string_lossy(),
        &out.to_string_lossy(),
    ]);
    let output = diff.output().unwrap();
    assert!(output.status.success());
    assert!(
        output.stdout.is_empty(),
        "expected an empty diff, got: {}",
        String::from_utf8_lossy(&output.stdout)
    );
}

#[cfg(not(target_os = "windows"))]
#[test]
fn diffing_different_masters_is_nonzero() {
    let d = tempdir().unwrap();
    let (schema, master) = write_sample_files(d.path());
    let changed = d.as_ref().join("changed.xml");
    fs::write(
        &changed,
        SAMPLE_MASTER.replace("132183, 10211", "132183, 10212"),
    )
    .unwrap();

    let mut diff = Command::cargo_bin("qcn_tool").expect("failed to find binary");
    diff.args([
        "-s",
        &schema.to_string_lossy(),
        "-d",
        &master.to_string_lossy(),
        &changed.to_string_lossy(),
    ]);
    let output = diff.output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}
