//! MBN reader: ELF32 program-header walk plus the MCFG record stream.
//!
//! An MBN is an ELF32 image whose `PT_LOAD` segment carries the MCFG
//! carrier-configuration records. The reader validates the ELF identity and
//! the MCFG magic, then normalises the record stream into the same
//! [`Snapshot`] shape the QCN reader produces.

use std::fs;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace, warn};

use crate::err::{QcnError, Result};
use crate::model::{EfsValue, NumberedValue, Snapshot};

/// `"MCFG"` read as a little-endian word.
pub const MCFG_MAGIC: u32 = 0x4753_434D;

/// Highest MCFG format version this reader understands.
pub const MCFG_FORMAT_CEILING: u16 = 3;

const PT_LOAD: u32 = 1;

const ELF32_HEADER_SIZE: usize = 52;
const ELF_PHOFF_OFFSET: u64 = 28;
const ELF_PHENTSIZE_OFFSET: u64 = 42;

/// Legacy numbered NV record.
const MCFG_ITEM_NV: u8 = 0x01;
/// EFS file record: a path document followed by a content document.
const MCFG_ITEM_EFS: u8 = 0x02;

pub fn read_mbn(path: impl AsRef<Path>) -> Result<Snapshot> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| QcnError::FailedToOpenFile {
        source,
        path: path.to_path_buf(),
    })?;
    read_mbn_from(&bytes)
}

pub fn read_mbn_from(bytes: &[u8]) -> Result<Snapshot> {
    let segment = load_segment(bytes)?;
    parse_mcfg(segment)
}

/// Locates the `PT_LOAD` segment by walking the ELF32 program headers.
fn load_segment(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < ELF32_HEADER_SIZE {
        return Err(QcnError::structural(
            "ELF header",
            0,
            format!("file is {} bytes, header needs {ELF32_HEADER_SIZE}", bytes.len()),
        ));
    }

    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if &magic != b"\x7fELF" {
        return Err(QcnError::InvalidElfMagic { magic });
    }
    if bytes[4] != 1 {
        return Err(QcnError::NotElf32 { class: bytes[4] });
    }
    if bytes[5] != 1 {
        return Err(QcnError::NotLittleEndianElf { encoding: bytes[5] });
    }

    let mut cursor = Cursor::new(bytes);
    cursor.seek(SeekFrom::Start(ELF_PHOFF_OFFSET))?;
    let phoff = cursor.read_u32::<LittleEndian>()?;
    cursor.seek(SeekFrom::Start(ELF_PHENTSIZE_OFFSET))?;
    let phentsize = cursor.read_u16::<LittleEndian>()?;
    let phnum = cursor.read_u16::<LittleEndian>()?;

    let mut found: Option<(u32, u32)> = None;
    for i in 0..phnum {
        let entry = u64::from(phoff) + u64::from(i) * u64::from(phentsize);
        cursor.seek(SeekFrom::Start(entry))?;
        let p_type = cursor.read_u32::<LittleEndian>()?;
        let p_offset = cursor.read_u32::<LittleEndian>()?;
        cursor.seek(SeekFrom::Current(8))?;
        let p_filesz = cursor.read_u32::<LittleEndian>()?;
        trace!("program header {i}: type {p_type:#x}, offset {p_offset:#x}, size {p_filesz:#x}");

        if p_type == PT_LOAD {
            if found.is_some() {
                warn!("multiple PT_LOAD segments, keeping the first");
                break;
            }
            found = Some((p_offset, p_filesz));
        }
    }

    let (offset, size) = found.ok_or(QcnError::NoLoadSegment)?;
    let start = offset as usize;
    let end = start.saturating_add(size as usize);
    if end > bytes.len() {
        return Err(QcnError::structural(
            "PT_LOAD segment",
            u64::from(offset),
            format!("segment runs to {end}, file is {} bytes", bytes.len()),
        ));
    }
    Ok(&bytes[start..end])
}

fn parse_mcfg(segment: &[u8]) -> Result<Snapshot> {
    let mut cursor = Cursor::new(segment);

    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != MCFG_MAGIC {
        return Err(QcnError::InvalidMcfgMagic { found: magic });
    }
    let format_version = cursor.read_u16::<LittleEndian>()?;
    if format_version > MCFG_FORMAT_CEILING {
        return Err(QcnError::UnsupportedMcfgVersion {
            version: format_version,
            ceiling: MCFG_FORMAT_CEILING,
        });
    }
    let config_type = cursor.read_u16::<LittleEndian>()?;
    let num_items = cursor.read_u32::<LittleEndian>()?;
    let _muxd_carrier = cursor.read_u16::<LittleEndian>()?;
    let _spare_crc = cursor.read_u16::<LittleEndian>()?;

    // Version record: {type, length, version}.
    let _vtype = cursor.read_u16::<LittleEndian>()?;
    let _vlen = cursor.read_u16::<LittleEndian>()?;
    let version = cursor.read_u32::<LittleEndian>()?;
    debug!(
        "mcfg: format {format_version}, type {config_type}, version {version:#x}, {num_items} items"
    );

    let mut snapshot = Snapshot::default();
    let mut efs_key = 1_usize;
    for n in 0..num_items {
        if let Err(e) = parse_item(&mut cursor, &mut snapshot, &mut efs_key) {
            // Item streams are decoded tolerantly; a truncated record ends
            // the walk but keeps everything already normalised.
            snapshot
                .errors
                .push(format!("mcfg item {} of {num_items}: {e}", n + 1));
            break;
        }
    }
    Ok(snapshot)
}

fn parse_item(
    cursor: &mut Cursor<&[u8]>,
    snapshot: &mut Snapshot,
    efs_key: &mut usize,
) -> std::io::Result<()> {
    // 8-byte record prefix; `length` covers the body that follows it.
    let length = cursor.read_u32::<LittleEndian>()?;
    let item_type = cursor.read_u8()?;
    let attrib = cursor.read_u8()?;
    let _sp_ops = cursor.read_u8()?;
    let _spare = cursor.read_u8()?;
    let body_start = cursor.position();

    match item_type {
        MCFG_ITEM_NV => {
            let id = cursor.read_u16::<LittleEndian>()?;
            let payload_len = cursor.read_u16::<LittleEndian>()?;
            let mut payload = vec![0_u8; usize::from(payload_len)];
            cursor.read_exact(&mut payload)?;

            let mut value = NumberedValue::new(u32::from(id));
            // The payload leads with the item index.
            if let Some((index, rest)) = payload.split_first() {
                value.index = u16::from(*index);
                value.data = Some(rest.to_vec());
            } else {
                value.data = Some(Vec::new());
            }
            trace!("mcfg nv item {id}, attrib {attrib:#x}");
            snapshot.numbered.insert(value.id, value);
        }
        MCFG_ITEM_EFS => {
            let _path_type = cursor.read_u16::<LittleEndian>()?;
            let path_len = cursor.read_u16::<LittleEndian>()?;
            let mut path = vec![0_u8; usize::from(path_len)];
            cursor.read_exact(&mut path)?;

            let _content_type = cursor.read_u16::<LittleEndian>()?;
            let content_len = cursor.read_u16::<LittleEndian>()?;
            let mut content = vec![0_u8; usize::from(content_len)];
            cursor.read_exact(&mut content)?;

            // Paths come NUL-terminated off the wire.
            let end = path.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            let mut value = EfsValue::new(String::from_utf8_lossy(&path[..end]).into_owned());
            value.data = Some(content);
            trace!("mcfg efs item {}", value.path);
            // Re-keyed to stringified integers from 1, matching the QCN
            // store shape.
            snapshot.nv_items.insert(efs_key.to_string(), value);
            *efs_key += 1;
        }
        other => {
            debug!("mcfg item type {other:#04x} recognised but not decoded");
        }
    }

    // Advance by the declared body length whatever the parse consumed, so
    // one short record cannot shear the whole stream.
    let next = body_start + u64::from(length);
    if cursor.position() != next {
        trace!(
            "mcfg record consumed {} of {length} declared bytes",
            cursor.position().saturating_sub(body_start)
        );
        cursor.set_position(next);
    }
    if next > cursor.get_ref().len() as u64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "record body runs past the segment",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal single-segment ELF32 wrapping the given MCFG bytes.
    fn wrap_in_elf(mcfg: &[u8]) -> Vec<u8> {
        let phoff = 52_u32;
        let phentsize = 32_u16;
        let data_offset = phoff + u32::from(phentsize);

        let mut out = Vec::new();
        out.extend_from_slice(b"\x7fELF");
        out.push(1); // ELFCLASS32
        out.push(1); // little-endian
        out.push(1); // version
        out.resize(16, 0);
        out.extend_from_slice(&2_u16.to_le_bytes()); // e_type
        out.extend_from_slice(&0_u16.to_le_bytes()); // e_machine
        out.extend_from_slice(&1_u32.to_le_bytes()); // e_version
        out.extend_from_slice(&0_u32.to_le_bytes()); // e_entry
        out.extend_from_slice(&phoff.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0_u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0_u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&52_u16.to_le_bytes()); // e_ehsize
        out.extend_from_slice(&phentsize.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&1_u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&[0; 6]); // e_shentsize..e_shstrndx
        assert_eq!(out.len(), 52);

        out.extend_from_slice(&PT_LOAD.to_le_bytes()); // p_type
        out.extend_from_slice(&data_offset.to_le_bytes()); // p_offset
        out.extend_from_slice(&0_u32.to_le_bytes()); // p_vaddr
        out.extend_from_slice(&0_u32.to_le_bytes()); // p_paddr
        out.extend_from_slice(&(mcfg.len() as u32).to_le_bytes()); // p_filesz
        out.extend_from_slice(&(mcfg.len() as u32).to_le_bytes()); // p_memsz
        out.extend_from_slice(&0_u32.to_le_bytes()); // p_flags
        out.extend_from_slice(&0_u32.to_le_bytes()); // p_align

        out.extend_from_slice(mcfg);
        out
    }

    fn mcfg_header(num_items: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MCFG_MAGIC.to_le_bytes());
        out.extend_from_slice(&2_u16.to_le_bytes()); // format version
        out.extend_from_slice(&0_u16.to_le_bytes()); // type
        out.extend_from_slice(&num_items.to_le_bytes());
        out.extend_from_slice(&0_u16.to_le_bytes()); // muxd carrier
        out.extend_from_slice(&0_u16.to_le_bytes()); // spare crc
        out.extend_from_slice(&1_u16.to_le_bytes()); // version record type
        out.extend_from_slice(&4_u16.to_le_bytes()); // version record length
        out.extend_from_slice(&0x06000000_u32.to_le_bytes());
        out
    }

    fn efs_record(path: &[u8], content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1_u16.to_le_bytes());
        body.extend_from_slice(&(path.len() as u16).to_le_bytes());
        body.extend_from_slice(path);
        body.extend_from_slice(&2_u16.to_le_bytes());
        body.extend_from_slice(&(content.len() as u16).to_le_bytes());
        body.extend_from_slice(content);

        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.push(MCFG_ITEM_EFS);
        out.extend_from_slice(&[0, 0, 0]); // attrib, sp_ops, spare
        out.extend_from_slice(&body);
        out
    }

    fn nv_record(id: u16, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_le_bytes());
        body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        body.extend_from_slice(payload);

        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.push(MCFG_ITEM_NV);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn ingests_an_efs_record() {
        let mut mcfg = mcfg_header(1);
        mcfg.extend(efs_record(b"/nv/item_files/x\x00", &[0x01, 0x02, 0x03]));
        let snapshot = read_mbn_from(&wrap_in_elf(&mcfg)).unwrap();

        let (key, value) = snapshot.nv_items.iter().next().unwrap();
        assert_eq!(key, "1");
        assert_eq!(value.path, "/nv/item_files/x");
        assert_eq!(value.data, Some(vec![0x01, 0x02, 0x03]));
        assert!(snapshot.errors.is_empty());
    }

    #[test]
    fn normalises_a_legacy_nv_record() {
        let mut mcfg = mcfg_header(1);
        mcfg.extend(nv_record(946, &[0x01, 0x57, 0x04, 0x02, 0x00]));
        let snapshot = read_mbn_from(&wrap_in_elf(&mcfg)).unwrap();

        let value = &snapshot.numbered[&946];
        assert_eq!(value.index, 1);
        assert_eq!(value.data, Some(vec![0x57, 0x04, 0x02, 0x00]));
    }

    #[test]
    fn skips_undecoded_record_types() {
        let mut mcfg = mcfg_header(2);
        let mut trailer = Vec::new();
        trailer.extend_from_slice(&4_u32.to_le_bytes());
        trailer.push(0x04); // recognised but not decoded
        trailer.extend_from_slice(&[0, 0, 0]);
        trailer.extend_from_slice(&[0xaa; 4]);
        mcfg.extend(trailer);
        mcfg.extend(efs_record(b"/nv/item_files/y\x00", &[9]));

        let snapshot = read_mbn_from(&wrap_in_elf(&mcfg)).unwrap();
        assert_eq!(snapshot.nv_items.len(), 1);
        assert_eq!(snapshot.nv_items.iter().next().unwrap().1.path, "/nv/item_files/y");
    }

    #[test]
    fn rejects_bad_elf_magic() {
        let result = read_mbn_from(&[0_u8; 64]);
        assert!(matches!(result, Err(QcnError::InvalidElfMagic { .. })));
    }

    #[test]
    fn rejects_bad_mcfg_magic() {
        let mut mcfg = mcfg_header(0);
        mcfg[0] = 0x00;
        let result = read_mbn_from(&wrap_in_elf(&mcfg));
        assert!(matches!(result, Err(QcnError::InvalidMcfgMagic { .. })));
    }

    #[test]
    fn rejects_future_format_versions() {
        let mut mcfg = mcfg_header(0);
        mcfg[4] = 4; // format version
        let result = read_mbn_from(&wrap_in_elf(&mcfg));
        assert!(matches!(
            result,
            Err(QcnError::UnsupportedMcfgVersion { version: 4, .. })
        ));
    }

    #[test]
    fn truncated_record_reports_and_keeps_earlier_items() {
        let mut mcfg = mcfg_header(2);
        mcfg.extend(efs_record(b"/nv/item_files/z\x00", &[7]));
        mcfg.extend_from_slice(&99_u32.to_le_bytes()); // declares a body that never comes
        mcfg.push(MCFG_ITEM_NV);
        mcfg.extend_from_slice(&[0, 0, 0]);

        let snapshot = read_mbn_from(&wrap_in_elf(&mcfg)).unwrap();
        assert_eq!(snapshot.nv_items.len(), 1);
        assert_eq!(snapshot.errors.len(), 1);
        assert!(snapshot.errors[0].contains("item 2 of 2"));
    }
}
