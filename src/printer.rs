//! Ordered human-readable rendering of a snapshot.
//!
//! Numbered items print in ascending id order, EFS items by lower-cased
//! path. Members render their decoded values; items with no schema fall
//! back to a hex/decimal byte dump. The flat view merges the three EFS
//! stores; verbose output prints each store under its own heading.

use std::io::{self, Write};

use crate::model::{DecodedValue, EfsValue, NumberedValue, Param, Snapshot};

#[derive(Debug, Clone, Copy, Default)]
pub struct PrintOptions {
    pub verbose: u8,
}

pub fn print_snapshot<W: Write>(
    out: &mut W,
    snapshot: &Snapshot,
    options: &PrintOptions,
) -> io::Result<()> {
    let v = &snapshot.file_version;
    writeln!(out, "file version: {}.{}.{}", v.major, v.minor, v.revision)?;

    let info = &snapshot.mobile_property_info;
    writeln!(out, "mobile phone number: {}", info.mobile_model_no)?;
    writeln!(out, "mobile sw version: {}", info.sw_version)?;
    writeln!(out, "qpst version: {}", info.qpst_version)?;
    writeln!(out)?;

    for value in snapshot.numbered.values() {
        print_numbered(out, value)?;
    }

    if options.verbose >= 1 {
        for (store_name, store) in snapshot.stores() {
            writeln!(out, "{store_name}:")?;
            let mut values: Vec<&EfsValue> = store.values().collect();
            values.sort_by_key(|value| value.path.to_lowercase());
            for value in values {
                print_efs(out, value)?;
            }
            writeln!(out)?;
        }
    } else {
        let mut values: Vec<&EfsValue> = snapshot
            .stores()
            .iter()
            .flat_map(|(_, store)| store.values())
            .collect();
        values.sort_by_key(|value| value.path.to_lowercase());
        for value in values {
            print_efs(out, value)?;
        }
    }

    Ok(())
}

fn print_numbered<W: Write>(out: &mut W, value: &NumberedValue) -> io::Result<()> {
    match &value.name {
        Some(name) if !name.is_empty() => writeln!(out, "NV item {} ({name}):", value.id)?,
        _ => writeln!(out, "NV item {}:", value.id)?,
    }
    print_body(out, &value.params, value.data.as_deref())
}

fn print_efs<W: Write>(out: &mut W, value: &EfsValue) -> io::Result<()> {
    writeln!(out, "EFS item {}:", value.path)?;
    print_body(out, &value.params, value.data.as_deref())
}

fn print_body<W: Write>(out: &mut W, params: &[Param], data: Option<&[u8]>) -> io::Result<()> {
    if params.is_empty() {
        return match data {
            Some(data) if !data.is_empty() => dump_bytes(out, data),
            _ => writeln!(out, "  <no data>"),
        };
    }
    for (ordinal, param) in params.iter().enumerate() {
        let label = if param.name.is_empty() {
            format!("member {ordinal}")
        } else {
            param.name.clone()
        };
        match &param.val {
            DecodedValue::Text(text) => writeln!(out, "  {label}: {text}")?,
            DecodedValue::Ints(values) => {
                let rendered: Vec<String> = values.iter().map(i128::to_string).collect();
                writeln!(out, "  {label}: {}", rendered.join(" "))?;
            }
            DecodedValue::None => writeln!(out, "  {label}: -")?,
        }
    }
    Ok(())
}

/// Schema-less fallback: the same bytes twice, hex then decimal.
fn dump_bytes<W: Write>(out: &mut W, data: &[u8]) -> io::Result<()> {
    let hex: Vec<String> = data.iter().map(|b| format!("{b:02x}")).collect();
    let dec: Vec<String> = data.iter().map(u8::to_string).collect();
    writeln!(out, "  data (hex): {}", hex.join(" "))?;
    writeln!(out, "  data (dec): {}", dec.join(" "))
}
