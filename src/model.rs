//! The unified in-memory model shared by every loader and sink.
//!
//! A [`Snapshot`] is built by exactly one loader (XML master, QCN, or MBN),
//! enriched once by the marshaller/decoder, then consumed by exactly one
//! sink (printer, writer, or diff). No shared mutation crosses components.

use std::collections::BTreeMap;
use std::fmt;

use crate::err::Diagnostic;
use crate::schema::PrimType;

/// An item is addressed either by its legacy numeric id or its EFS path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Id(u32),
    Path(String),
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Id(id) => write!(f, "{id}"),
            ItemKey::Path(path) => f.write_str(path),
        }
    }
}

/// Text encoding declared on a master-file value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Hex,
    #[default]
    Dec,
    Str,
}

impl Encoding {
    /// `None` for an unrecognised name; the caller records the diagnostic
    /// and falls back to the default.
    pub fn from_name(name: &str) -> Option<Encoding> {
        match name {
            "hex" => Some(Encoding::Hex),
            "dec" => Some(Encoding::Dec),
            "string" => Some(Encoding::Str),
            _ => None,
        }
    }
}

/// The shape of a value's source content, fixed at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueShape {
    /// Comma/whitespace-separated scalar tokens.
    Scalar(String),
    /// Structured children, each naming a member by tag.
    Members(Vec<MemberValue>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberValue {
    pub tag: String,
    pub content: String,
}

/// A decoded member value, for rendering only; bytes are authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DecodedValue {
    #[default]
    None,
    Ints(Vec<i128>),
    Text(String),
}

/// One marshalled/decoded member: the schema view plus value, bytes, and
/// whatever went wrong, which never blocks the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: PrimType,
    pub size: usize,
    pub val: DecodedValue,
    pub data: Vec<u8>,
    pub errors: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberedValue {
    pub id: u32,
    pub name: Option<String>,
    pub index: u16,
    pub mapping: Option<String>,
    pub encoding: Encoding,
    pub shape: Option<ValueShape>,
    pub params: Vec<Param>,
    pub data: Option<Vec<u8>>,
    pub errors: Vec<Diagnostic>,
}

impl NumberedValue {
    pub fn new(id: u32) -> NumberedValue {
        NumberedValue {
            id,
            name: None,
            index: 1,
            mapping: None,
            encoding: Encoding::default(),
            shape: None,
            params: Vec::new(),
            data: None,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfsValue {
    pub path: String,
    pub index: u16,
    pub mapping: Option<String>,
    pub encoding: Encoding,
    /// Declared `useProvisioningStore` on the master value.
    pub provisioning: bool,
    /// Sourced from a numbered id at or above the RF NV floor.
    pub backup: bool,
    /// Stored bytes are zlib-compressed (schema `compressed` flag).
    pub compressed: bool,
    pub shape: Option<ValueShape>,
    pub params: Vec<Param>,
    pub data: Option<Vec<u8>>,
    pub errors: Vec<Diagnostic>,
}

impl EfsValue {
    pub fn new(path: impl Into<String>) -> EfsValue {
        EfsValue {
            path: path.into(),
            index: 1,
            mapping: None,
            encoding: Encoding::default(),
            provisioning: false,
            backup: false,
            compressed: false,
            shape: None,
            params: Vec::new(),
            data: None,
            errors: Vec::new(),
        }
    }
}

/// An ordinal-keyed EFS stream. Insertion order is the wire order, so this
/// is a sequence with map-like lookup rather than a sorted map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EfsStore {
    entries: Vec<(String, EfsValue)>,
}

impl EfsStore {
    /// Replaces in place on ordinal collision, preserving the original
    /// position (last write wins for the value, first for the order).
    pub fn insert(&mut self, ordinal: impl Into<String>, value: EfsValue) {
        let ordinal = ordinal.into();
        match self.entries.iter_mut().find(|(k, _)| *k == ordinal) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((ordinal, value)),
        }
    }

    /// Returns the value under `ordinal`, creating an empty one at the end
    /// of the sequence if absent.
    pub fn entry(&mut self, ordinal: &str) -> &mut EfsValue {
        let pos = match self.entries.iter().position(|(k, _)| k == ordinal) {
            Some(pos) => pos,
            None => {
                self.entries
                    .push((ordinal.to_owned(), EfsValue::new(String::new())));
                self.entries.len() - 1
            }
        };
        &mut self.entries[pos].1
    }

    pub fn get(&self, ordinal: &str) -> Option<&EfsValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == ordinal)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EfsValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &EfsValue> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut EfsValue> {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The `File_Version` root stream: three little-endian words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileVersion {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
}

impl FileVersion {
    /// Version stamped on snapshots compiled from XML masters.
    pub const COMPILED: FileVersion = FileVersion {
        major: 2,
        minor: 0,
        revision: 0,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MobilePropertyInfo {
    pub efs: u32,
    pub mobile_model_no: u16,
    pub major_rev: u8,
    pub minor_rev: u8,
    pub sw_version: String,
    pub qpst_version: String,
}

/// Store names as they appear in the compound-file tree.
pub const STORE_NV_ITEMS: &str = "NV_Items";
pub const STORE_PROVISIONING: &str = "Provisioning_Item_Files";
pub const STORE_BACKUP: &str = "EFS_Backup";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub file_version: FileVersion,
    pub mobile_property_info: MobilePropertyInfo,
    pub numbered: BTreeMap<u32, NumberedValue>,
    pub nv_items: EfsStore,
    pub provisioning: EfsStore,
    pub backup: EfsStore,
    /// Run-level diagnostics in production order.
    pub errors: Vec<String>,
    /// Compound-file nodes nothing claimed during the walk.
    pub unprocessed: Vec<String>,
}

impl Snapshot {
    pub fn stores(&self) -> [(&'static str, &EfsStore); 3] {
        [
            (STORE_PROVISIONING, &self.provisioning),
            (STORE_NV_ITEMS, &self.nv_items),
            (STORE_BACKUP, &self.backup),
        ]
    }

    /// Every diagnostic in the snapshot, rendered in production order:
    /// run-level first, then per-item keyed by id or path.
    pub fn collect_errors(&self) -> Vec<String> {
        let mut out = self.errors.clone();
        for value in self.numbered.values() {
            for e in &value.errors {
                out.push(format!("item {}: {e}", value.id));
            }
        }
        for (_, store) in self.stores() {
            for value in store.values() {
                for e in &value.errors {
                    out.push(format!("item {}: {e}", value.path));
                }
            }
        }
        out
    }
}
