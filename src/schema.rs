//! NV-definition schema interpreter.
//!
//! Parses the vendor XML dialect (`NvItem`, `NvEfsItem`, `DataType` elements
//! with `Member` children) into an immutable [`Catalog`], resolves composite
//! data types down to primitive members, and computes advisory aggregate
//! sizes.
//!
//! Composite resolution is an explicit topological resolve with cycle
//! detection. The historical engine resolved EFS items through repeated
//! substitution passes but numbered items through a single pass; that
//! asymmetry is kept reachable through [`SchemaOptions::numbered_subst`],
//! whose default matches the historical behaviour.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use log::{debug, trace, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::err::{QcnError, Result};

/// Numbered item ids at or above this value describe RF NV data that lives
/// in the EFS rather than the legacy numbered store.
pub const RFNV_ID_FLOOR: u32 = 20000;

/// Synthesised EFS path for an RF NV item id.
pub fn rfnv_path(id: u32) -> String {
    format!("/nv/item_files/rfnv/000{}", id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Str,
}

impl PrimType {
    pub fn from_name(name: &str) -> Option<PrimType> {
        match name {
            "int8" => Some(PrimType::Int8),
            "int16" => Some(PrimType::Int16),
            "int32" => Some(PrimType::Int32),
            "int64" => Some(PrimType::Int64),
            "uint8" => Some(PrimType::Uint8),
            "uint16" => Some(PrimType::Uint16),
            "uint32" => Some(PrimType::Uint32),
            "uint64" => Some(PrimType::Uint64),
            "string" => Some(PrimType::Str),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimType::Int8 => "int8",
            PrimType::Int16 => "int16",
            PrimType::Int32 => "int32",
            PrimType::Int64 => "int64",
            PrimType::Uint8 => "uint8",
            PrimType::Uint16 => "uint16",
            PrimType::Uint32 => "uint32",
            PrimType::Uint64 => "uint64",
            PrimType::Str => "string",
        }
    }

    /// Wire width in bits; `string` members are sized in bytes elsewhere.
    pub fn bits(self) -> u8 {
        match self {
            PrimType::Int8 | PrimType::Uint8 => 8,
            PrimType::Int16 | PrimType::Uint16 => 16,
            PrimType::Int32 | PrimType::Uint32 => 32,
            PrimType::Int64 | PrimType::Uint64 => 64,
            PrimType::Str => 0,
        }
    }

    pub fn byte_width(self) -> usize {
        usize::from(self.bits() / 8)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PrimType::Int8 | PrimType::Int16 | PrimType::Int32 | PrimType::Int64
        )
    }
}

/// A member type is either a primitive or a reference to a named
/// `DataType`. After catalog construction only unresolved references (an
/// unknown alias or a cycle, both reported) remain as `Alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberType {
    Prim(PrimType),
    Alias(String),
}

impl MemberType {
    fn from_name(name: &str) -> MemberType {
        match PrimType::from_name(name) {
            Some(prim) => MemberType::Prim(prim),
            None => MemberType::Alias(name.to_owned()),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            MemberType::Prim(p) => p.name(),
            MemberType::Alias(name) => name,
        }
    }
}

/// One named field of a structured item: primitive tag plus element count
/// (byte length for `string`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub ty: MemberType,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberedItem {
    pub id: u32,
    pub name: String,
    pub permission: Option<String>,
    pub members: Vec<Member>,
    /// Advisory aggregate byte size; used only where payload length is
    /// otherwise unknown.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfsItem {
    pub path: String,
    pub permission: Option<String>,
    pub compressed: bool,
    pub variable_size: bool,
    pub members: Vec<Member>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataType {
    pub name: String,
    pub members: Vec<Member>,
}

/// How deep composite aliases are expanded for numbered items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubstDepth {
    /// One level of alias expansion, matching the historical engine.
    #[default]
    SingleLevel,
    /// Full topological resolution, same as EFS items.
    Full,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaOptions {
    pub numbered_subst: SubstDepth,
}

/// The immutable outcome of interpreting one schema document.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub numbered: BTreeMap<u32, NumberedItem>,
    pub efs: BTreeMap<String, EfsItem>,
    pub types: HashMap<String, DataType>,
    pub errors: Vec<String>,
}

impl Catalog {
    pub fn from_path(path: impl AsRef<Path>, options: &SchemaOptions) -> Result<Catalog> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| QcnError::FailedToOpenFile {
            source,
            path: path.to_path_buf(),
        })?;
        Self::from_str(&text, options).map_err(|e| match e {
            QcnError::Xml { source, .. } => QcnError::Xml {
                source,
                path: path.to_path_buf(),
            },
            other => other,
        })
    }

    pub fn from_str(xml: &str, options: &SchemaOptions) -> Result<Catalog> {
        let mut builder = CatalogBuilder::default();
        builder.parse(xml)?;
        Ok(builder.finish(options))
    }

    pub fn numbered_members(&self, id: u32) -> &[Member] {
        self.numbered.get(&id).map_or(&[], |item| &item.members)
    }

    pub fn efs_item(&self, path: &str) -> Option<&EfsItem> {
        self.efs.get(path)
    }
}

#[derive(Debug, Default)]
struct CatalogBuilder {
    numbered: BTreeMap<u32, NumberedItem>,
    efs: BTreeMap<String, EfsItem>,
    types: HashMap<String, DataType>,
    errors: Vec<String>,
}

enum OpenElement {
    Numbered(NumberedItem),
    Efs(EfsItem),
    Type(DataType),
}

impl CatalogBuilder {
    fn parse(&mut self, xml: &str) -> Result<()> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut open: Option<OpenElement> = None;
        loop {
            match reader.read_event().map_err(|source| QcnError::Xml {
                source,
                path: Default::default(),
            })? {
                Event::Start(e) => self.handle_element(&e, &mut open, false)?,
                Event::Empty(e) => self.handle_element(&e, &mut open, true)?,
                Event::End(e) => {
                    let closes_container = matches!(
                        e.name().as_ref(),
                        b"NvItem" | b"NvEfsItem" | b"DataType"
                    );
                    if closes_container {
                        if let Some(element) = open.take() {
                            self.commit(element);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if let Some(element) = open.take() {
            self.commit(element);
        }
        Ok(())
    }

    fn handle_element(
        &mut self,
        e: &BytesStart,
        open: &mut Option<OpenElement>,
        self_closing: bool,
    ) -> Result<()> {
        match e.name().as_ref() {
            b"NvItem" => {
                if let Some(previous) = open.take() {
                    self.commit(previous);
                }
                match self.open_numbered(e) {
                    Some(element) if self_closing => self.commit(element),
                    Some(element) => *open = Some(element),
                    None => {}
                }
            }
            b"NvEfsItem" => {
                if let Some(previous) = open.take() {
                    self.commit(previous);
                }
                match self.open_efs(e) {
                    Some(element) if self_closing => self.commit(element),
                    Some(element) => *open = Some(element),
                    None => {}
                }
            }
            b"DataType" => {
                if let Some(previous) = open.take() {
                    self.commit(previous);
                }
                match self.open_type(e) {
                    Some(element) if self_closing => self.commit(element),
                    Some(element) => *open = Some(element),
                    None => {}
                }
            }
            b"Member" => {
                let member = self.read_member(e);
                match open {
                    Some(OpenElement::Numbered(item)) => item.members.push(member),
                    Some(OpenElement::Efs(item)) => item.members.push(member),
                    Some(OpenElement::Type(ty)) => ty.members.push(member),
                    None => self.errors.push(format!(
                        "member `{}` appears outside of NvItem/NvEfsItem/DataType",
                        member.name
                    )),
                }
            }
            other => {
                trace!(
                    "ignoring schema element `{}`",
                    String::from_utf8_lossy(other)
                );
            }
        }
        Ok(())
    }

    fn open_numbered(&mut self, e: &BytesStart) -> Option<OpenElement> {
        let mut id: Option<u32> = None;
        let mut name = String::new();
        let mut permission = None;
        for attr in attributes(e, &mut self.errors) {
            let (key, value) = attr;
            match key.as_str() {
                "id" => match value.parse::<u32>() {
                    Ok(v) => id = Some(v),
                    Err(_) => {
                        self.errors
                            .push(format!("NvItem id `{value}` is not numeric"));
                        return None;
                    }
                },
                "name" => name = value,
                "permission" => permission = Some(value),
                _ => {}
            }
        }
        let id = match id {
            Some(id) => id,
            None => {
                self.errors.push("NvItem without an id".to_owned());
                return None;
            }
        };
        if id >= RFNV_ID_FLOOR {
            // RF NV definitions live in the EFS under a synthesised path.
            return Some(OpenElement::Efs(EfsItem {
                path: rfnv_path(id),
                permission,
                compressed: false,
                variable_size: false,
                members: Vec::new(),
                size: 0,
            }));
        }
        Some(OpenElement::Numbered(NumberedItem {
            id,
            name,
            permission,
            members: Vec::new(),
            size: 0,
        }))
    }

    fn open_efs(&mut self, e: &BytesStart) -> Option<OpenElement> {
        let mut path = None;
        let mut permission = None;
        let mut compressed = false;
        let mut variable_size = false;
        for (key, value) in attributes(e, &mut self.errors) {
            match key.as_str() {
                "fullpathname" => path = Some(value),
                "permission" => permission = Some(value),
                "compressed" => compressed = flag(&value),
                "variableSize" | "variablesize" => variable_size = flag(&value),
                _ => {}
            }
        }
        let path = match path {
            Some(path) => path,
            None => {
                self.errors
                    .push("NvEfsItem without a fullpathname".to_owned());
                return None;
            }
        };
        Some(OpenElement::Efs(EfsItem {
            path,
            permission,
            compressed,
            variable_size,
            members: Vec::new(),
            size: 0,
        }))
    }

    fn open_type(&mut self, e: &BytesStart) -> Option<OpenElement> {
        let mut name = None;
        for (key, value) in attributes(e, &mut self.errors) {
            if key == "name" {
                name = Some(value);
            }
        }
        let name = match name {
            Some(name) => name,
            None => {
                self.errors.push("DataType without a name".to_owned());
                return None;
            }
        };
        Some(OpenElement::Type(DataType {
            name,
            members: Vec::new(),
        }))
    }

    fn read_member(&mut self, e: &BytesStart) -> Member {
        let mut name = String::new();
        let mut ty = MemberType::Prim(PrimType::Uint8);
        let mut size = 1_usize;
        for (key, value) in attributes(e, &mut self.errors) {
            match key.as_str() {
                "name" => name = value,
                "type" => ty = MemberType::from_name(&value),
                "sizeOf" => match value.parse::<usize>() {
                    Ok(v) => size = v,
                    Err(_) => self.errors.push(format!(
                        "member `{name}` has non-numeric sizeOf `{value}`"
                    )),
                },
                _ => {}
            }
        }
        Member { name, ty, size }
    }

    fn commit(&mut self, element: OpenElement) {
        match element {
            OpenElement::Numbered(item) => {
                if self.numbered.contains_key(&item.id) {
                    self.errors
                        .push(format!("duplicate definition of NV item {}", item.id));
                }
                self.numbered.insert(item.id, item);
            }
            OpenElement::Efs(item) => {
                if self.efs.contains_key(&item.path) {
                    self.errors
                        .push(format!("duplicate definition of EFS item {}", item.path));
                }
                self.efs.insert(item.path.clone(), item);
            }
            OpenElement::Type(ty) => {
                if self.types.contains_key(&ty.name) {
                    self.errors
                        .push(format!("duplicate definition of data type {}", ty.name));
                }
                self.types.insert(ty.name.clone(), ty);
            }
        }
    }

    fn finish(mut self, options: &SchemaOptions) -> Catalog {
        let resolved = resolve_types(&self.types, &mut self.errors);

        for item in self.efs.values_mut() {
            item.members = substitute(&item.members, &resolved, &self.types, SubstDepth::Full);
            item.size = aggregate_size(&item.members);
        }
        for item in self.numbered.values_mut() {
            item.members = substitute(
                &item.members,
                &resolved,
                &self.types,
                options.numbered_subst,
            );
            item.size = aggregate_size(&item.members);
        }

        debug!(
            "catalog: {} numbered items, {} efs items, {} data types, {} errors",
            self.numbered.len(),
            self.efs.len(),
            self.types.len(),
            self.errors.len()
        );

        Catalog {
            numbered: self.numbered,
            efs: self.efs,
            types: self.types,
            errors: self.errors,
        }
    }
}

fn flag(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes")
}

fn attributes(e: &BytesStart, errors: &mut Vec<String>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        match attr {
            Ok(attr) => {
                let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                match attr.unescape_value() {
                    Ok(value) => out.push((key, value.into_owned())),
                    Err(e) => errors.push(format!("bad attribute value for `{key}`: {e}")),
                }
            }
            Err(e) => errors.push(format!("bad attribute: {e}")),
        }
    }
    out
}

#[derive(Clone, Copy, PartialEq)]
enum ResolveState {
    InProgress,
    Done,
}

/// Topologically flattens every `DataType` body down to primitives.
/// Cycles and unknown aliases are reported once per offender and their
/// references left literal.
fn resolve_types(
    types: &HashMap<String, DataType>,
    errors: &mut Vec<String>,
) -> HashMap<String, Vec<Member>> {
    let mut resolved: HashMap<String, Vec<Member>> = HashMap::new();
    let mut state: HashMap<String, ResolveState> = HashMap::new();

    fn visit(
        name: &str,
        types: &HashMap<String, DataType>,
        resolved: &mut HashMap<String, Vec<Member>>,
        state: &mut HashMap<String, ResolveState>,
        errors: &mut Vec<String>,
    ) {
        match state.get(name) {
            Some(ResolveState::Done) => return,
            Some(ResolveState::InProgress) => {
                errors.push(format!("data type `{name}` participates in a cycle"));
                return;
            }
            None => {}
        }
        state.insert(name.to_owned(), ResolveState::InProgress);

        let body = match types.get(name) {
            Some(ty) => ty.members.clone(),
            None => {
                state.insert(name.to_owned(), ResolveState::Done);
                return;
            }
        };

        let mut flat = Vec::new();
        for member in body {
            match &member.ty {
                MemberType::Prim(_) => flat.push(member),
                MemberType::Alias(inner) => {
                    visit(inner, types, resolved, state, errors);
                    match resolved.get(inner) {
                        Some(inner_flat) => {
                            for _ in 0..member.size {
                                flat.extend(inner_flat.iter().cloned());
                            }
                        }
                        // Cycle participant or unknown alias: leave literal.
                        None => flat.push(member.clone()),
                    }
                }
            }
        }

        // A body that still carries aliases is a cycle participant; keep it
        // out of the resolved map so referencing items report it too.
        let fully_primitive = flat.iter().all(|m| matches!(m.ty, MemberType::Prim(_)));
        if fully_primitive && types.contains_key(name) {
            resolved.insert(name.to_owned(), flat);
        }
        state.insert(name.to_owned(), ResolveState::Done);
    }

    let mut names: Vec<&String> = types.keys().collect();
    names.sort();
    for name in names {
        visit(name, types, &mut resolved, &mut state, errors);
    }
    resolved
}

/// Replaces aliased members with the alias body repeated `size` times,
/// flattened. `Full` splices the topologically resolved body; `SingleLevel`
/// splices the raw body, leaving nested references literal.
fn substitute(
    members: &[Member],
    resolved: &HashMap<String, Vec<Member>>,
    raw: &HashMap<String, DataType>,
    depth: SubstDepth,
) -> Vec<Member> {
    let mut out = Vec::with_capacity(members.len());
    for member in members {
        let alias = match &member.ty {
            MemberType::Prim(_) => {
                out.push(member.clone());
                continue;
            }
            MemberType::Alias(name) => name,
        };
        let body = match depth {
            SubstDepth::Full => resolved.get(alias),
            SubstDepth::SingleLevel => raw.get(alias).map(|ty| &ty.members),
        };
        match body {
            Some(body) => {
                for _ in 0..member.size {
                    out.extend(body.iter().cloned());
                }
            }
            None => {
                warn!("member `{}` references unresolved type `{alias}`", member.name);
                out.push(member.clone());
            }
        }
    }
    out
}

/// Advisory size: numeric suffix of the type name gives the bit width;
/// non-numeric type names contribute zero.
fn aggregate_size(members: &[Member]) -> usize {
    members
        .iter()
        .map(|m| bits_of_type_name(m.ty.type_name()) / 8 * m.size)
        .sum()
}

fn bits_of_type_name(name: &str) -> usize {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .chars()
        .rev()
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}
