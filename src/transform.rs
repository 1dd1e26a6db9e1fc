//! Item transformer: walks the loaded master maps against the catalog,
//! marshals every value, and partitions EFS items into the three stores.

use log::{debug, trace};

use crate::marshal::{decode_value, inflate, marshal_value, ItemFlags};
use crate::master::MasterFile;
use crate::model::Snapshot;
use crate::schema::Catalog;

/// How ordinal stream names are formatted. The transformer historically
/// wrote `%08X` while the provisioning path of the QCN writer wrote `%08d`;
/// both survive behind this knob until a ground-truth reader settles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrdinalStyle {
    #[default]
    Hex,
    Dec,
}

impl OrdinalStyle {
    pub fn format(self, n: usize) -> String {
        match self {
            OrdinalStyle::Hex => format!("{n:08X}"),
            OrdinalStyle::Dec => format!("{n:08}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    pub ordinal_style: OrdinalStyle,
}

/// Builds a snapshot from a loaded master file: every item marshalled, EFS
/// items separated into provisioning/backup/plain stores.
pub fn build_snapshot(
    catalog: &Catalog,
    master: MasterFile,
    options: &TransformOptions,
) -> Snapshot {
    let mut snapshot = Snapshot {
        file_version: crate::model::FileVersion::COMPILED,
        errors: master.errors,
        ..Snapshot::default()
    };

    for (id, mut value) in master.numbered {
        let members = catalog.numbered_members(id);
        let outcome = marshal_value(
            members,
            value.shape.as_ref(),
            value.encoding,
            ItemFlags::default(),
        );
        value.params = outcome.params;
        value.data = outcome.data;
        value.errors.extend(outcome.errors);
        fill_name(&mut value, catalog);
        trace!("marshalled numbered item {id}");
        snapshot.numbered.insert(id, value);
    }

    let mut counters = [0_usize; 3];
    for (_, mut value) in master.efs {
        let item = catalog.efs_item(&value.path);
        let (members, flags) = match item {
            Some(item) => (
                item.members.as_slice(),
                ItemFlags {
                    variable_size: item.variable_size,
                    compressed: item.compressed,
                },
            ),
            None => (&[][..], ItemFlags::default()),
        };
        let outcome = marshal_value(members, value.shape.as_ref(), value.encoding, flags);
        value.params = outcome.params;
        value.data = outcome.data;
        value.compressed = flags.compressed;
        value.errors.extend(outcome.errors);

        let (slot, store) = if value.provisioning {
            (0, &mut snapshot.provisioning)
        } else if value.backup {
            (2, &mut snapshot.backup)
        } else {
            (1, &mut snapshot.nv_items)
        };
        let ordinal = options.ordinal_style.format(counters[slot]);
        counters[slot] += 1;
        store.insert(ordinal, value);
    }

    debug!(
        "snapshot: {} numbered, {} provisioning, {} nv, {} backup",
        snapshot.numbered.len(),
        snapshot.provisioning.len(),
        snapshot.nv_items.len(),
        snapshot.backup.len()
    );
    snapshot
}

/// Fills decoded params on container-sourced values that carry bytes but no
/// decoded view yet. Compressed EFS payloads are inflated first.
pub fn enrich_snapshot(snapshot: &mut Snapshot, catalog: &Catalog) {
    for value in snapshot.numbered.values_mut() {
        fill_name(value, catalog);
        if !value.params.is_empty() {
            continue;
        }
        let members = catalog.numbered_members(value.id);
        if members.is_empty() {
            continue;
        }
        if let Some(data) = &value.data {
            let (params, errors) = decode_value(members, data);
            value.params = params;
            value.errors.extend(errors);
        }
    }

    let stores = [
        &mut snapshot.provisioning,
        &mut snapshot.nv_items,
        &mut snapshot.backup,
    ];
    for store in stores {
        for value in store.values_mut() {
            if !value.params.is_empty() {
                continue;
            }
            let item = match catalog.efs_item(&value.path) {
                Some(item) => item,
                None => continue,
            };
            let data = match &value.data {
                Some(data) => data,
                None => continue,
            };
            let decoded = if item.compressed {
                match inflate(data) {
                    Ok(plain) => {
                        value.compressed = true;
                        Some(plain)
                    }
                    Err(e) => {
                        value.errors.push(e);
                        None
                    }
                }
            } else {
                Some(data.clone())
            };
            if let Some(plain) = decoded {
                let (params, errors) = decode_value(&item.members, &plain);
                value.params = params;
                value.errors.extend(errors);
            }
        }
    }
}

/// Items carry no name on the wire; the schema supplies it for rendering.
fn fill_name(value: &mut crate::model::NumberedValue, catalog: &Catalog) {
    if value.name.is_none() {
        value.name = catalog
            .numbered
            .get(&value.id)
            .filter(|item| !item.name.is_empty())
            .map(|item| item.name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master;
    use crate::schema::{Catalog, SchemaOptions};
    use indoc::indoc;
    use std::path::Path;

    fn fixture() -> (Catalog, MasterFile) {
        let catalog = Catalog::from_str(
            indoc! {r#"
                <NvDefinition>
                  <NvItem id="946" name="band_pref">
                    <Member name="band1" type="int32" sizeOf="1"/>
                    <Member name="band2" type="int16" sizeOf="1"/>
                  </NvItem>
                  <NvEfsItem fullpathname="/nv/item_files/modem/lte/cat">
                    <Member name="cat" type="uint8" sizeOf="1"/>
                  </NvEfsItem>
                  <NvEfsItem fullpathname="/nv/item_files/modem/prov">
                    <Member name="x" type="uint16" sizeOf="1"/>
                  </NvEfsItem>
                  <NvItem id="20001">
                    <Member name="chan" type="uint16" sizeOf="2"/>
                  </NvItem>
                </NvDefinition>
            "#},
            &SchemaOptions::default(),
        )
        .unwrap();

        let mut m = MasterFile::default();
        master::parse_str(
            indoc! {r#"
                <NvSource>
                  <NvItem id="946">132183, 10211</NvItem>
                  <NvEfsItem fullpathname="/nv/item_files/modem/lte/cat">6</NvEfsItem>
                  <NvEfsItem fullpathname="/nv/item_files/modem/prov" useProvisioningStore="true">7</NvEfsItem>
                  <NvItem id="20001">1, 2</NvItem>
                </NvSource>
            "#},
            Path::new("."),
            &mut m,
        )
        .unwrap();
        (catalog, m)
    }

    #[test]
    fn every_efs_item_lands_in_exactly_one_store() {
        let (catalog, master) = fixture();
        let snapshot = build_snapshot(&catalog, master, &TransformOptions::default());

        assert_eq!(snapshot.provisioning.len(), 1);
        assert_eq!(snapshot.nv_items.len(), 1);
        assert_eq!(snapshot.backup.len(), 1);
        assert_eq!(
            snapshot.provisioning.values().next().unwrap().path,
            "/nv/item_files/modem/prov"
        );
        assert_eq!(
            snapshot.backup.values().next().unwrap().path,
            "/nv/item_files/rfnv/00020001"
        );
    }

    #[test]
    fn ordinals_are_zero_padded_hex_by_default() {
        let (catalog, master) = fixture();
        let snapshot = build_snapshot(&catalog, master, &TransformOptions::default());
        let (ordinal, _) = snapshot.nv_items.iter().next().unwrap();
        assert_eq!(ordinal, "00000000");
        assert_eq!(OrdinalStyle::Hex.format(26), "0000001A");
        assert_eq!(OrdinalStyle::Dec.format(26), "00000026");
    }

    #[test]
    fn numbered_items_carry_marshalled_bytes() {
        let (catalog, master) = fixture();
        let snapshot = build_snapshot(&catalog, master, &TransformOptions::default());
        assert_eq!(
            snapshot.numbered[&946].data,
            Some(vec![0x57, 0x04, 0x02, 0x00, 0xe3, 0x27])
        );
    }

    #[test]
    fn enrich_decodes_container_sourced_bytes() {
        let (catalog, master) = fixture();
        let mut snapshot = build_snapshot(&catalog, master, &TransformOptions::default());
        // Simulate a container source: bytes present, no decoded view.
        for value in snapshot.numbered.values_mut() {
            value.params.clear();
        }
        enrich_snapshot(&mut snapshot, &catalog);
        let params = &snapshot.numbered[&946].params;
        assert_eq!(params.len(), 2);
        assert_eq!(
            params[0].val,
            crate::model::DecodedValue::Ints(vec![132183])
        );
    }
}
