//! Master value-file loader.
//!
//! Parses the value XML into id-keyed and path-keyed value maps, following
//! `xi:include` directives relative to the including file's directory (the
//! base directory is always passed explicitly, never taken from the process
//! working directory). Include errors merge into the parent's error list and
//! colliding definitions are last-write-wins.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, trace, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::err::{Diagnostic, QcnError, Result};
use crate::model::{Encoding, MemberValue, NumberedValue, EfsValue, ValueShape};
use crate::schema::{rfnv_path, RFNV_ID_FLOOR};

#[derive(Debug, Default)]
pub struct MasterFile {
    pub numbered: BTreeMap<u32, NumberedValue>,
    /// Insertion-ordered; the transformer's ordinal keys follow this order.
    pub efs: Vec<(String, EfsValue)>,
    pub errors: Vec<String>,
}

impl MasterFile {
    fn insert_efs(&mut self, value: EfsValue) {
        match self.efs.iter_mut().find(|(p, _)| *p == value.path) {
            Some((_, existing)) => *existing = value,
            None => self.efs.push((value.path.clone(), value)),
        }
    }
}

pub fn load_master(path: impl AsRef<Path>) -> Result<MasterFile> {
    let path = path.as_ref();
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut out = MasterFile::default();
    parse_file(path, base_dir, &mut out)?;
    debug!(
        "master file {}: {} numbered values, {} efs values, {} errors",
        path.display(),
        out.numbered.len(),
        out.efs.len(),
        out.errors.len()
    );
    Ok(out)
}

fn parse_file(path: &Path, base_dir: &Path, out: &mut MasterFile) -> Result<()> {
    let text = fs::read_to_string(path).map_err(|source| QcnError::FailedToOpenFile {
        source,
        path: path.to_path_buf(),
    })?;
    parse_str(&text, base_dir, out).map_err(|e| match e {
        QcnError::Xml { source, .. } => QcnError::Xml {
            source,
            path: path.to_path_buf(),
        },
        other => other,
    })
}

/// Parses one document, recursing into includes against `base_dir`.
pub fn parse_str(xml: &str, base_dir: &Path, out: &mut MasterFile) -> Result<()> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    // (value under construction, structured children, scalar text parts)
    let mut open: Option<OpenValue> = None;
    let mut child_tag: Option<String> = None;

    loop {
        match reader.read_event().map_err(|source| QcnError::Xml {
            source,
            path: Default::default(),
        })? {
            Event::Start(e) => match e.name().as_ref() {
                b"xi:include" | b"include" => include(&e, base_dir, out),
                b"NvItem" | b"NvEfsItem" => {
                    if let Some(previous) = open.take() {
                        previous.commit(out);
                    }
                    open = open_value(&e, out);
                }
                tag if open.is_some() => {
                    let tag = String::from_utf8_lossy(tag).into_owned();
                    if let Some(value) = open.as_mut() {
                        value.children.push(MemberValue {
                            tag: tag.clone(),
                            content: String::new(),
                        });
                    }
                    child_tag = Some(tag);
                }
                other => {
                    trace!(
                        "ignoring master element `{}`",
                        String::from_utf8_lossy(other)
                    );
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"xi:include" | b"include" => include(&e, base_dir, out),
                b"NvItem" | b"NvEfsItem" => {
                    if let Some(previous) = open.take() {
                        previous.commit(out);
                    }
                    if let Some(value) = open_value(&e, out) {
                        value.commit(out);
                    }
                }
                tag if open.is_some() => {
                    let tag = String::from_utf8_lossy(tag).into_owned();
                    if let Some(value) = open.as_mut() {
                        value.children.push(MemberValue {
                            tag,
                            content: String::new(),
                        });
                    }
                }
                _ => {}
            },
            Event::Text(t) => {
                let text = match t.unescape() {
                    Ok(text) => text.into_owned(),
                    Err(e) => {
                        out.errors.push(format!("bad text node: {e}"));
                        continue;
                    }
                };
                if let Some(value) = open.as_mut() {
                    match (&child_tag, value.children.last_mut()) {
                        // First content string of the open child.
                        (Some(_), Some(child)) if child.content.is_empty() => {
                            child.content = text;
                        }
                        (Some(_), _) => {}
                        (None, _) => value.scalar_parts.push(text),
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"NvItem" | b"NvEfsItem" => {
                    if let Some(value) = open.take() {
                        value.commit(out);
                    }
                    child_tag = None;
                }
                _ => child_tag = None,
            },
            Event::Eof => break,
            _ => {}
        }
    }
    if let Some(value) = open.take() {
        value.commit(out);
    }
    Ok(())
}

/// A value element mid-parse; turned into a numbered or EFS value on close.
struct OpenValue {
    key: ValueKey,
    name: Option<String>,
    index: u16,
    mapping: Option<String>,
    encoding: Encoding,
    provisioning: bool,
    children: Vec<MemberValue>,
    scalar_parts: Vec<String>,
    errors: Vec<Diagnostic>,
}

enum ValueKey {
    Id(u32),
    Path(String),
}

impl OpenValue {
    fn shape(&self) -> Option<ValueShape> {
        if !self.children.is_empty() {
            if !self.scalar_parts.is_empty() {
                warn!("value mixes scalar text with structured children; keeping the children");
            }
            return Some(ValueShape::Members(self.children.clone()));
        }
        if !self.scalar_parts.is_empty() {
            return Some(ValueShape::Scalar(self.scalar_parts.join(" ")));
        }
        None
    }

    fn commit(self, out: &mut MasterFile) {
        let shape = self.shape();
        match self.key {
            ValueKey::Id(id) if id < RFNV_ID_FLOOR => {
                let mut value = NumberedValue::new(id);
                value.name = self.name;
                value.index = self.index;
                value.mapping = self.mapping;
                value.encoding = self.encoding;
                value.shape = shape;
                value.errors = self.errors;
                out.numbered.insert(id, value);
            }
            ValueKey::Id(id) => {
                let mut value = EfsValue::new(rfnv_path(id));
                value.index = self.index;
                value.mapping = self.mapping;
                value.encoding = self.encoding;
                value.provisioning = self.provisioning;
                value.backup = true;
                value.shape = shape;
                value.errors = self.errors;
                out.insert_efs(value);
            }
            ValueKey::Path(path) => {
                let mut value = EfsValue::new(path);
                value.index = self.index;
                value.mapping = self.mapping;
                value.encoding = self.encoding;
                value.provisioning = self.provisioning;
                value.shape = shape;
                value.errors = self.errors;
                out.insert_efs(value);
            }
        }
    }
}

fn open_value(e: &BytesStart, out: &mut MasterFile) -> Option<OpenValue> {
    let is_efs = e.name().as_ref() == b"NvEfsItem";

    let mut id = None;
    let mut path = None;
    let mut name = None;
    let mut index = 1_u16;
    let mut mapping = None;
    let mut encoding = Encoding::default();
    let mut provisioning = false;
    let mut errors = Vec::new();

    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(e) => {
                out.errors.push(format!("bad attribute: {e}"));
                continue;
            }
        };
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = match attr.unescape_value() {
            Ok(v) => v.into_owned(),
            Err(e) => {
                out.errors
                    .push(format!("bad attribute value for `{key}`: {e}"));
                continue;
            }
        };
        match key.as_str() {
            "id" => match value.parse::<u32>() {
                Ok(v) => id = Some(v),
                Err(_) => {
                    out.errors
                        .push(format!("NvItem id `{value}` is not numeric"));
                    return None;
                }
            },
            "fullpathname" => path = Some(value),
            "name" => name = Some(value),
            "index" => match value.parse::<u16>() {
                Ok(v) => index = v,
                Err(_) => out
                    .errors
                    .push(format!("index `{value}` is not numeric, using 1")),
            },
            "mapping" => mapping = Some(value),
            "encoding" => match Encoding::from_name(&value) {
                Some(enc) => encoding = enc,
                None => errors.push(Diagnostic::UnknownEncoding(value)),
            },
            "useProvisioningStore" => provisioning = matches!(value.as_str(), "true" | "1"),
            _ => {}
        }
    }

    let key = if is_efs {
        match path {
            Some(path) => ValueKey::Path(path),
            None => {
                out.errors
                    .push("NvEfsItem without a fullpathname".to_owned());
                return None;
            }
        }
    } else {
        match id {
            Some(id) => ValueKey::Id(id),
            None => {
                out.errors.push("NvItem without an id".to_owned());
                return None;
            }
        }
    };

    Some(OpenValue {
        key,
        name,
        index,
        mapping,
        encoding,
        provisioning,
        children: Vec::new(),
        scalar_parts: Vec::new(),
        errors,
    })
}

fn include(e: &BytesStart, base_dir: &Path, out: &mut MasterFile) {
    let mut href = None;
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == b"href" {
            if let Ok(value) = attr.unescape_value() {
                href = Some(value.into_owned());
            }
        }
    }
    let href = match href {
        Some(href) => href,
        None => {
            out.errors.push("xi:include without an href".to_owned());
            return;
        }
    };

    let target = base_dir.join(&href);
    let next_base = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| base_dir.to_path_buf());
    debug!("including {}", target.display());
    // Loaders are tolerant: a broken include is reported, not fatal.
    if let Err(e) = parse_file(&target, &next_base, out) {
        out.errors
            .push(format!("include {}: {e}", target.display()));
    }
}
