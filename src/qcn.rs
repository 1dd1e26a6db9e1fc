//! QCN compound-file reader and writer.
//!
//! A QCN is an OLE2 compound file. The directory tree this module produces
//! and consumes:
//!
//! ```text
//! /
//! ├── File_Version
//! └── 00000000/
//!     └── default/
//!         ├── Mobile_Property_Info
//!         ├── Provisioning_Item_Files/ {EFS_Dir, EFS_Data}
//!         ├── NV_Items/                {EFS_Dir, EFS_Data}
//!         ├── EFS_Backup/              {EFS_Dir, EFS_Data}
//!         └── NV_NUMBERED_ITEMS/NV_ITEM_ARRAY
//! ```
//!
//! The reader is tolerant: malformed streams append to the snapshot's error
//! list and the walk continues. The writer is strict: a size violation or
//! compound-file I/O failure aborts the emit.

use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cfb::CompoundFile;
use log::{debug, trace, warn};

use crate::err::{QcnError, Result};
use crate::model::{
    EfsStore, FileVersion, MobilePropertyInfo, NumberedValue, Snapshot, STORE_BACKUP,
    STORE_NV_ITEMS, STORE_PROVISIONING,
};
use crate::transform::OrdinalStyle;

/// Fixed payload size of one numbered item; shorter payloads are
/// zero-padded to this, longer ones refuse to write.
pub const NV_PAYLOAD_SIZE: usize = 128;

/// Packet stride in `NV_ITEM_ARRAY`: an 8-byte header plus the payload.
pub const NV_PACKET_SIZE: usize = 136;

/// Bytes prepended to every `EFS_Backup` path on the wire, replacing the
/// path's first byte. Observed verbatim in QPST-produced captures; the
/// field layout behind it is undocumented.
pub const EFS_BACKUP_PATH_PREFIX: [u8; 8] = [0x01, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00];

const DEFAULT_DIR: &str = "/00000000/default";

#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Ordinal format for the provisioning store's document names. The
    /// historical writer used `%08d` here while every other store carries
    /// the transformer's `%08X` keys.
    pub provisioning_ordinal: ProvisioningOrdinal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvisioningOrdinal {
    #[default]
    Dec,
    /// Keep the transformer's keys untouched.
    AsKeyed,
}

pub fn write_qcn(snapshot: &Snapshot, path: impl AsRef<Path>, options: &WriterOptions) -> Result<()> {
    let path = path.as_ref();
    let mut comp = cfb::create(path)?;
    emit(&mut comp, snapshot, options)?;
    comp.flush()?;
    Ok(())
}

/// Writer over any seekable sink; used by the diff pipeline and tests.
pub fn write_qcn_to<F: Read + Write + Seek>(
    snapshot: &Snapshot,
    inner: F,
    options: &WriterOptions,
) -> Result<F> {
    let mut comp = CompoundFile::create(inner)?;
    emit(&mut comp, snapshot, options)?;
    comp.flush()?;
    Ok(comp.into_inner())
}

fn emit<F: Read + Write + Seek>(
    comp: &mut CompoundFile<F>,
    snapshot: &Snapshot,
    options: &WriterOptions,
) -> Result<()> {
    {
        let mut stream = comp.create_stream("/File_Version")?;
        let v = &snapshot.file_version;
        stream.write_u16::<LittleEndian>(v.major)?;
        stream.write_u16::<LittleEndian>(v.minor)?;
        stream.write_u16::<LittleEndian>(v.revision)?;
    }

    comp.create_storage("/00000000")?;
    comp.create_storage(DEFAULT_DIR)?;

    {
        let mut stream = comp.create_stream(format!("{DEFAULT_DIR}/Mobile_Property_Info"))?;
        let info = &snapshot.mobile_property_info;
        stream.write_u32::<LittleEndian>(info.efs)?;
        stream.write_u16::<LittleEndian>(info.mobile_model_no)?;
        stream.write_u8(info.major_rev)?;
        stream.write_u8(info.minor_rev)?;
        stream.write_u16::<LittleEndian>(info.sw_version.len() as u16)?;
        stream.write_all(info.sw_version.as_bytes())?;
        stream.write_u16::<LittleEndian>(info.qpst_version.len() as u16)?;
        stream.write_all(info.qpst_version.as_bytes())?;
    }

    for (store_name, store) in snapshot.stores() {
        emit_store(comp, store_name, store, options)?;
    }

    comp.create_storage(format!("{DEFAULT_DIR}/NV_NUMBERED_ITEMS"))?;
    let mut stream = comp.create_stream(format!("{DEFAULT_DIR}/NV_NUMBERED_ITEMS/NV_ITEM_ARRAY"))?;
    for value in snapshot.numbered.values() {
        let empty = Vec::new();
        let payload = value.data.as_ref().unwrap_or(&empty);
        if payload.len() > NV_PAYLOAD_SIZE {
            return Err(QcnError::PayloadTooLarge {
                id: value.id,
                len: payload.len(),
                limit: NV_PAYLOAD_SIZE,
            });
        }
        stream.write_u16::<LittleEndian>(NV_PACKET_SIZE as u16)?;
        stream.write_u16::<LittleEndian>(value.index)?;
        stream.write_u16::<LittleEndian>(value.id as u16)?;
        stream.write_u16::<LittleEndian>(0)?;
        stream.write_all(payload)?;
        stream.write_all(&vec![0; NV_PAYLOAD_SIZE - payload.len()])?;
        trace!("wrote numbered item {} packet", value.id);
    }

    Ok(())
}

fn emit_store<F: Read + Write + Seek>(
    comp: &mut CompoundFile<F>,
    store_name: &str,
    store: &EfsStore,
    options: &WriterOptions,
) -> Result<()> {
    let base = format!("{DEFAULT_DIR}/{store_name}");
    comp.create_storage(&base)?;
    comp.create_storage(format!("{base}/EFS_Dir"))?;
    comp.create_storage(format!("{base}/EFS_Data"))?;

    for (n, (ordinal, value)) in store.iter().enumerate() {
        let name = if store_name == STORE_PROVISIONING
            && options.provisioning_ordinal == ProvisioningOrdinal::Dec
        {
            OrdinalStyle::Dec.format(n)
        } else {
            ordinal.to_owned()
        };

        let path_bytes = if store_name == STORE_BACKUP {
            // The prefix replaces the path's first byte (the leading `/`).
            let mut bytes = EFS_BACKUP_PATH_PREFIX.to_vec();
            bytes.extend_from_slice(&value.path.as_bytes()[1.min(value.path.len())..]);
            bytes
        } else {
            value.path.as_bytes().to_vec()
        };

        let mut dir = comp.create_stream(format!("{base}/EFS_Dir/{name}"))?;
        dir.write_all(&path_bytes)?;
        drop(dir);

        let empty = Vec::new();
        let data = value.data.as_ref().unwrap_or(&empty);
        let mut doc = comp.create_stream(format!("{base}/EFS_Data/{name}"))?;
        doc.write_all(data)?;
    }
    Ok(())
}

pub fn read_qcn(path: impl AsRef<Path>) -> Result<Snapshot> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| QcnError::FailedToOpenFile {
        source,
        path: path.to_path_buf(),
    })?;
    read_qcn_from(file)
}

pub fn read_qcn_from<F: Read + Seek>(inner: F) -> Result<Snapshot> {
    let mut comp = CompoundFile::open(inner)?;
    let mut snapshot = Snapshot::default();

    // Depth-first tree order; collect first so the streams can be opened
    // with the compound file borrowed mutably.
    let stream_paths: Vec<PathBuf> = comp
        .walk()
        .filter(|entry| entry.is_stream())
        .map(|entry| entry.path().to_path_buf())
        .collect();

    for stream_path in stream_paths {
        let mut bytes = Vec::new();
        comp.open_stream(&stream_path)?.read_to_end(&mut bytes)?;
        dispatch_stream(&stream_path, bytes, &mut snapshot);
    }

    debug!(
        "read qcn: {} numbered, {} provisioning, {} nv, {} backup, {} unprocessed",
        snapshot.numbered.len(),
        snapshot.provisioning.len(),
        snapshot.nv_items.len(),
        snapshot.backup.len(),
        snapshot.unprocessed.len()
    );
    Ok(snapshot)
}

fn dispatch_stream(path: &Path, bytes: Vec<u8>, snapshot: &mut Snapshot) {
    let name = component_name(path, 0);
    let parent = component_name(path, 1);
    let store_name = component_name(path, 2);

    match name.as_str() {
        "File_Version" => {
            if let Err(e) = parse_file_version(&bytes, &mut snapshot.file_version) {
                snapshot.errors.push(format!("File_Version: {e}"));
            }
            return;
        }
        "Mobile_Property_Info" => {
            if let Err(e) = parse_mobile_property_info(&bytes, &mut snapshot.mobile_property_info) {
                snapshot.errors.push(format!("Mobile_Property_Info: {e}"));
            }
            return;
        }
        "NV_ITEM_ARRAY" => {
            parse_item_array(&bytes, snapshot);
            return;
        }
        _ => {}
    }

    match parent.as_str() {
        "EFS_Dir" => {
            if let Some(store) = store_of(snapshot, &store_name) {
                let backup = store_name == STORE_BACKUP;
                let value = store.entry(&name);
                value.path = parse_efs_path(&bytes, backup);
                value.provisioning = store_name == STORE_PROVISIONING;
                value.backup = backup;
            } else {
                warn!("EFS_Dir document under unknown store `{store_name}`");
                snapshot.unprocessed.push(path.display().to_string());
            }
        }
        "EFS_Data" => {
            if let Some(store) = store_of(snapshot, &store_name) {
                let backup = store_name == STORE_BACKUP;
                let value = store.entry(&name);
                value.data = Some(bytes);
                value.provisioning = store_name == STORE_PROVISIONING;
                value.backup = backup;
            } else {
                warn!("EFS_Data document under unknown store `{store_name}`");
                snapshot.unprocessed.push(path.display().to_string());
            }
        }
        _ => {
            trace!("unprocessed stream {}", path.display());
            snapshot.unprocessed.push(path.display().to_string());
        }
    }
}

/// Path component `levels_up` from the leaf, as text.
fn component_name(path: &Path, levels_up: usize) -> String {
    let mut current = path;
    for _ in 0..levels_up {
        current = match current.parent() {
            Some(parent) => parent,
            None => return String::new(),
        };
    }
    current
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn store_of<'a>(snapshot: &'a mut Snapshot, store_name: &str) -> Option<&'a mut EfsStore> {
    match store_name {
        STORE_PROVISIONING => Some(&mut snapshot.provisioning),
        STORE_NV_ITEMS => Some(&mut snapshot.nv_items),
        STORE_BACKUP => Some(&mut snapshot.backup),
        _ => None,
    }
}

/// Restores a legible path from the stored bytes, undoing the backup
/// prefix where present.
fn parse_efs_path(bytes: &[u8], backup: bool) -> String {
    if backup && bytes.starts_with(&EFS_BACKUP_PATH_PREFIX) {
        return format!(
            "/{}",
            String::from_utf8_lossy(&bytes[EFS_BACKUP_PATH_PREFIX.len()..])
        );
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_file_version(bytes: &[u8], out: &mut FileVersion) -> std::io::Result<()> {
    let mut cursor = Cursor::new(bytes);
    out.major = cursor.read_u16::<LittleEndian>()?;
    out.minor = cursor.read_u16::<LittleEndian>()?;
    out.revision = cursor.read_u16::<LittleEndian>()?;
    Ok(())
}

fn parse_mobile_property_info(bytes: &[u8], out: &mut MobilePropertyInfo) -> std::io::Result<()> {
    let mut cursor = Cursor::new(bytes);
    out.efs = cursor.read_u32::<LittleEndian>()?;
    out.mobile_model_no = cursor.read_u16::<LittleEndian>()?;
    out.major_rev = cursor.read_u8()?;
    out.minor_rev = cursor.read_u8()?;

    let sw_len = cursor.read_u16::<LittleEndian>()?;
    let mut sw = vec![0_u8; usize::from(sw_len)];
    cursor.read_exact(&mut sw)?;
    out.sw_version = String::from_utf8_lossy(&sw).into_owned();

    let qpst_len = cursor.read_u16::<LittleEndian>()?;
    let mut qpst = vec![0_u8; usize::from(qpst_len)];
    cursor.read_exact(&mut qpst)?;
    out.qpst_version = String::from_utf8_lossy(&qpst).into_owned();
    Ok(())
}

/// Decodes the packet concatenation tolerantly: a bad packet is reported
/// and the walk resumes at the next stride.
fn parse_item_array(bytes: &[u8], snapshot: &mut Snapshot) {
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 8 {
            snapshot
                .errors
                .push(format!("NV_ITEM_ARRAY: {} trailing bytes", rest.len()));
            return;
        }
        let stream_size = u16::from_le_bytes([rest[0], rest[1]]);
        let index = u16::from_le_bytes([rest[2], rest[3]]);
        let id = u16::from_le_bytes([rest[4], rest[5]]);

        let payload_len = usize::from(stream_size).saturating_sub(8);
        if stream_size as usize != NV_PACKET_SIZE {
            snapshot.errors.push(format!(
                "NV_ITEM_ARRAY: item {id} declares stream size {stream_size}, expected {NV_PACKET_SIZE}"
            ));
        }
        if rest.len() < 8 + payload_len {
            snapshot.errors.push(format!(
                "NV_ITEM_ARRAY: item {id} payload truncated ({} of {payload_len} bytes)",
                rest.len() - 8
            ));
            return;
        }

        let mut value = NumberedValue::new(u32::from(id));
        value.index = index;
        value.data = Some(rest[8..8 + payload_len].to_vec());
        snapshot.numbered.insert(value.id, value);

        rest = &rest[8 + payload_len..];
    }
}
