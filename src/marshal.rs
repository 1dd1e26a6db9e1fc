//! Value marshaller and decoder.
//!
//! The marshalling path converts textual value expressions into bit-exact
//! byte layouts against the schema member list; the decoder is the inverse,
//! used when printing container-sourced bytes. Both are tolerant: anything
//! that goes wrong is collected as a [`Diagnostic`] on the item while
//! emission continues with best-effort bytes (zeros where unknown).

use std::io::Write;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::trace;

use crate::codec::{
    pack_int, pack_string_fixed, pack_uint, uint8_or_ascii, unpack_cstr, unpack_int, unpack_uint,
    DecodedBytes,
};
use crate::err::Diagnostic;
use crate::model::{DecodedValue, Encoding, MemberValue, Param, ValueShape};
use crate::schema::{Member, MemberType, PrimType};

/// Schema flags that change how the aggregated bytes are produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemFlags {
    pub variable_size: bool,
    pub compressed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MarshalOutcome {
    pub params: Vec<Param>,
    pub data: Option<Vec<u8>>,
    pub errors: Vec<Diagnostic>,
}

/// The `uint8`-to-string promotion gate. The policy lives here and nowhere
/// else: a `uint8` run declared longer than 20 elements whose source has no
/// comma separator is carrying ASCII, not numbers.
fn promotes_to_string(ty: PrimType, declared: usize, source: &str) -> bool {
    ty == PrimType::Uint8 && declared > 20 && !source.contains(',')
}

/// Marshals one item's value expression against its schema members.
pub fn marshal_value(
    members: &[Member],
    shape: Option<&ValueShape>,
    encoding: Encoding,
    flags: ItemFlags,
) -> MarshalOutcome {
    let empty_scalar;
    let shape = match shape {
        Some(shape) => shape,
        None => {
            empty_scalar = ValueShape::Scalar(String::new());
            &empty_scalar
        }
    };

    if members.is_empty() {
        return marshal_without_schema(shape, encoding, flags);
    }

    let Marshalled {
        mut params,
        mut item_errors,
        presents,
        wants,
        defined,
    } = match shape {
        ValueShape::Scalar(raw) => marshal_scalar(members, raw, encoding),
        ValueShape::Members(children) => marshal_children(members, children, encoding),
    };

    if flags.variable_size {
        truncate_absent_tail(&mut params, &presents, &mut item_errors);
    }

    // The declared count only spans retained members, so a legitimately
    // shortened variable-size item is not a mismatch.
    let declared: usize = wants[..params.len()].iter().sum();
    if declared != defined {
        item_errors.push(Diagnostic::LengthMismatch { declared, defined });
    }

    finish(params, item_errors, flags)
}

/// Per-member marshalling results before item-level aggregation.
struct Marshalled {
    params: Vec<Param>,
    item_errors: Vec<Diagnostic>,
    /// Which members received any source content at all.
    presents: Vec<bool>,
    /// Element count each member declares against the source.
    wants: Vec<usize>,
    /// Element count the source actually supplied.
    defined: usize,
}

/// No schema: a single scalar still produces one `uint8` byte so dumps show
/// something, anything structured is refused.
fn marshal_without_schema(
    shape: &ValueShape,
    encoding: Encoding,
    flags: ItemFlags,
) -> MarshalOutcome {
    let single = match shape {
        ValueShape::Scalar(raw) => {
            let tokens = tokenize(raw);
            (tokens.len() == 1).then(|| tokens[0].to_owned())
        }
        ValueShape::Members(_) => None,
    };

    match single {
        Some(token) => {
            let fallback = Member {
                name: String::new(),
                ty: MemberType::Prim(PrimType::Uint8),
                size: 1,
            };
            let param = marshal_tokens(&fallback, PrimType::Uint8, &[token.as_str()], encoding, false);
            finish(vec![param], vec![Diagnostic::MissingSchema], flags)
        }
        None => MarshalOutcome {
            params: Vec::new(),
            data: None,
            errors: vec![Diagnostic::Schema(
                "no schema for a multi-element value".to_owned(),
            )],
        },
    }
}

fn marshal_scalar(members: &[Member], raw: &str, encoding: Encoding) -> Marshalled {
    let tokens = tokenize(raw);
    let mut pos = 0_usize;
    let mut params = Vec::with_capacity(members.len());
    let mut presents = Vec::with_capacity(members.len());
    let mut wants = Vec::with_capacity(members.len());

    for member in members {
        let (ty, member_errors) = primitive_of(member);
        let promoted = promotes_to_string(ty, member.size, raw);
        let want = if ty == PrimType::Str || promoted {
            1
        } else {
            member.size
        };
        let taken = &tokens[pos.min(tokens.len())..(pos + want).min(tokens.len())];
        pos += taken.len();

        presents.push(!taken.is_empty());
        wants.push(want);
        let mut param = if taken.is_empty() {
            empty_param(member, ty)
        } else {
            marshal_tokens(member, ty, taken, encoding, promoted)
        };
        prepend_errors(&mut param, member_errors);
        params.push(param);
    }

    Marshalled {
        params,
        item_errors: Vec::new(),
        presents,
        wants,
        defined: tokens.len(),
    }
}

fn marshal_children(members: &[Member], children: &[MemberValue], encoding: Encoding) -> Marshalled {
    let mut params = Vec::with_capacity(members.len());
    let mut presents = Vec::with_capacity(members.len());
    let mut item_errors = Vec::new();

    // Tag-name matches claim their child first; members left unmatched
    // fall back to the child at their own ordinal, if still unclaimed.
    let mut claimed = vec![false; children.len()];
    let mut assignment: Vec<Option<usize>> = vec![None; members.len()];
    for (mi, member) in members.iter().enumerate() {
        if member.name.is_empty() {
            continue;
        }
        if let Some(ci) = children.iter().position(|c| c.tag == member.name) {
            if !claimed[ci] {
                claimed[ci] = true;
                assignment[mi] = Some(ci);
            }
        }
    }
    for (mi, slot) in assignment.iter_mut().enumerate() {
        if slot.is_none() && mi < children.len() && !claimed[mi] {
            claimed[mi] = true;
            *slot = Some(mi);
        }
    }

    for (ordinal, member) in members.iter().enumerate() {
        let (ty, member_errors) = primitive_of(member);
        let child = assignment[ordinal].map(|ci| &children[ci]);

        let (present, mut param) = match child {
            None => (false, empty_param(member, ty)),
            Some(child) => {
                let promoted = promotes_to_string(ty, member.size, &child.content);
                let tokens = tokenize(&child.content);
                let want = if ty == PrimType::Str || promoted {
                    1
                } else {
                    member.size
                };
                if !tokens.is_empty() && tokens.len() != want {
                    item_errors.push(Diagnostic::in_member(
                        label(member, ordinal),
                        Diagnostic::LengthMismatch {
                            declared: want,
                            defined: tokens.len(),
                        },
                    ));
                }
                if tokens.is_empty() {
                    (false, empty_param(member, ty))
                } else {
                    let take = &tokens[..tokens.len().min(want)];
                    (true, marshal_tokens(member, ty, take, encoding, promoted))
                }
            }
        };
        presents.push(present);
        prepend_errors(&mut param, member_errors);
        params.push(param);
    }

    // One child answers for one member, whatever its token count; intra-
    // child shortfalls were reported per member above.
    Marshalled {
        params,
        item_errors,
        presents,
        wants: vec![1; members.len()],
        defined: children.len(),
    }
}

/// Marshals the token group one member consumes.
fn marshal_tokens(
    member: &Member,
    ty: PrimType,
    tokens: &[&str],
    encoding: Encoding,
    promoted: bool,
) -> Param {
    let mut errors = Vec::new();

    if ty == PrimType::Str || promoted {
        let text = tokens[0];
        if tokens.len() > 1 {
            errors.push(Diagnostic::StringWithSiblings);
        }
        return Param {
            name: member.name.clone(),
            ty: PrimType::Str,
            size: member.size,
            val: DecodedValue::Text(text.to_owned()),
            data: pack_string_fixed(text, member.size),
            errors,
        };
    }

    if ty == PrimType::Uint8 {
        return marshal_uint8_tokens(member, tokens, encoding);
    }

    let mut data = Vec::with_capacity(tokens.len() * ty.byte_width());
    let mut values = Vec::with_capacity(tokens.len());
    for token in tokens {
        match parse_number(token, encoding) {
            Some(value) => match pack_prim(ty, value) {
                Ok(bytes) => {
                    data.extend_from_slice(&bytes);
                    values.push(value);
                }
                Err(e) => {
                    errors.push(e);
                    data.extend(std::iter::repeat(0).take(ty.byte_width()));
                    values.push(0);
                }
            },
            None => {
                errors.push(Diagnostic::NotANumber((*token).to_owned()));
                data.extend(std::iter::repeat(0).take(ty.byte_width()));
                values.push(0);
            }
        }
    }
    // Under-supplied members zero-fill; the shortfall is reported once at
    // the item level.
    data.resize(member.size * ty.byte_width(), 0);

    Param {
        name: member.name.clone(),
        ty,
        size: member.size,
        val: DecodedValue::Ints(values),
        data,
        errors,
    }
}

/// `uint8` is overloaded: numeric tokens are bytes, a lone non-numeric
/// token is an ASCII string filling the whole member. A non-numeric token
/// among siblings is refused.
fn marshal_uint8_tokens(member: &Member, tokens: &[&str], encoding: Encoding) -> Param {
    let all_numeric = tokens
        .iter()
        .all(|t| parse_number(t, encoding).is_some());

    if !all_numeric && tokens.len() == 1 {
        trace!("uint8 member `{}` carries ASCII", member.name);
        return Param {
            name: member.name.clone(),
            ty: PrimType::Str,
            size: member.size,
            val: DecodedValue::Text(tokens[0].to_owned()),
            data: pack_string_fixed(tokens[0], member.size),
            errors: Vec::new(),
        };
    }

    let mut errors = Vec::new();
    let mut data = Vec::with_capacity(member.size);
    let mut values = Vec::with_capacity(tokens.len());
    let mut string_reported = false;
    for token in tokens {
        match parse_number(token, encoding) {
            Some(value) => match pack_uint(8, value) {
                Ok(bytes) => {
                    data.extend_from_slice(&bytes);
                    values.push(value);
                }
                Err(e) => {
                    errors.push(e);
                    data.push(0);
                    values.push(0);
                }
            },
            None => {
                if !string_reported {
                    errors.push(Diagnostic::StringWithSiblings);
                    string_reported = true;
                }
                data.extend_from_slice(&pack_string_fixed(token, 1));
                values.push(0);
            }
        }
    }
    data.resize(member.size, 0);

    Param {
        name: member.name.clone(),
        ty: PrimType::Uint8,
        size: member.size,
        val: DecodedValue::Ints(values),
        data,
        errors,
    }
}

fn prepend_errors(param: &mut Param, mut leading: Vec<Diagnostic>) {
    if leading.is_empty() {
        return;
    }
    leading.extend(std::mem::take(&mut param.errors));
    param.errors = leading;
}

fn empty_param(member: &Member, ty: PrimType) -> Param {
    Param {
        name: member.name.clone(),
        ty,
        size: member.size,
        val: DecodedValue::None,
        data: Vec::new(),
        errors: Vec::new(),
    }
}

/// Members left aliased by substitution marshal as zero bytes with a type
/// diagnostic.
fn primitive_of(member: &Member) -> (PrimType, Vec<Diagnostic>) {
    match &member.ty {
        MemberType::Prim(p) => (*p, Vec::new()),
        MemberType::Alias(name) => (
            PrimType::Uint8,
            vec![Diagnostic::UnknownType(name.clone())],
        ),
    }
}

/// Drops the absent tail of a variable-size item. Presence must be a
/// monotone `1…10…0` prefix; gaps keep every member and get reported.
fn truncate_absent_tail(
    params: &mut Vec<Param>,
    presents: &[bool],
    item_errors: &mut Vec<Diagnostic>,
) {
    let first_absent = presents.iter().position(|p| !p).unwrap_or(presents.len());
    let monotone = presents[first_absent..].iter().all(|p| !p);
    if monotone {
        params.truncate(first_absent);
    } else {
        item_errors.push(Diagnostic::Schema(
            "variable-size item has non-contiguous members".to_owned(),
        ));
    }
}

fn finish(params: Vec<Param>, item_errors: Vec<Diagnostic>, flags: ItemFlags) -> MarshalOutcome {
    let mut data = Vec::new();
    let mut errors = item_errors;

    for (ordinal, param) in params.iter().enumerate() {
        data.extend_from_slice(&param.data);
        for e in &param.errors {
            errors.push(Diagnostic::in_member(label_of(param, ordinal), e.clone()));
        }
    }

    let data = if flags.compressed {
        match compress(&data) {
            Ok(compressed) => compressed,
            Err(e) => {
                errors.push(Diagnostic::Schema(format!("compression failed: {e}")));
                data
            }
        }
    } else {
        data
    };

    MarshalOutcome {
        params,
        data: Some(data),
        errors,
    }
}

fn label(member: &Member, ordinal: usize) -> String {
    if member.name.is_empty() {
        format!("member {ordinal}")
    } else {
        member.name.clone()
    }
}

fn label_of(param: &Param, ordinal: usize) -> String {
    if param.name.is_empty() {
        format!("member {ordinal}")
    } else {
        param.name.clone()
    }
}

fn tokenize(raw: &str) -> Vec<&str> {
    raw.split(|c| matches!(c, ' ' | ',' | '\t' | '\n' | '\r'))
        .filter(|t| !t.is_empty())
        .collect()
}

fn parse_number(token: &str, encoding: Encoding) -> Option<i128> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        return i128::from_str_radix(hex, 16).ok();
    }
    match encoding {
        Encoding::Hex => i128::from_str_radix(token, 16).ok(),
        Encoding::Dec => {
            let digits = token.strip_prefix('-').unwrap_or(token);
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                token.parse().ok()
            } else {
                None
            }
        }
        Encoding::Str => None,
    }
}

fn pack_prim(ty: PrimType, value: i128) -> Result<Vec<u8>, Diagnostic> {
    if ty.is_signed() {
        pack_int(ty.bits(), value)
    } else {
        pack_uint(ty.bits(), value)
    }
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates a `compressed` EFS payload back to the aggregated bytes.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, Diagnostic> {
    use std::io::Read;
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Diagnostic::Schema(format!("decompression failed: {e}")))?;
    Ok(out)
}

/// The inverse path: unpacks container-sourced bytes against the schema
/// members for rendering. Bytes stay authoritative; this only fills `val`.
pub fn decode_value(members: &[Member], bytes: &[u8]) -> (Vec<Param>, Vec<Diagnostic>) {
    let mut rest = bytes;
    let mut params = Vec::with_capacity(members.len());
    let mut errors = Vec::new();

    for (ordinal, member) in members.iter().enumerate() {
        let ty = match &member.ty {
            MemberType::Prim(p) => *p,
            MemberType::Alias(name) => {
                errors.push(Diagnostic::in_member(
                    label(member, ordinal),
                    Diagnostic::UnknownType(name.clone()),
                ));
                break;
            }
        };

        let result = decode_member(member, ty, rest);
        match result {
            Ok((remainder, param)) => {
                rest = remainder;
                params.push(param);
            }
            Err(e) => {
                errors.push(Diagnostic::in_member(label(member, ordinal), e));
                break;
            }
        }
    }

    (params, errors)
}

fn decode_member<'a>(
    member: &Member,
    ty: PrimType,
    bytes: &'a [u8],
) -> Result<(&'a [u8], Param), Diagnostic> {
    if ty == PrimType::Str {
        let (rest, text) = unpack_cstr(bytes, member.size)?;
        let data = bytes[..member.size].to_vec();
        return Ok((
            rest,
            Param {
                name: member.name.clone(),
                ty,
                size: member.size,
                val: DecodedValue::Text(text),
                data,
                errors: Vec::new(),
            },
        ));
    }

    if ty == PrimType::Uint8 {
        if bytes.len() < member.size {
            return Err(Diagnostic::Truncated {
                t: "uint8 run",
                need: member.size,
                have: bytes.len(),
            });
        }
        let (head, rest) = bytes.split_at(member.size);
        // Container payloads are zero-padded; the padding must not defeat
        // the ASCII heuristic.
        let content = head.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let val = match uint8_or_ascii(&head[..content]) {
            DecodedBytes::Ascii(text) => DecodedValue::Text(text),
            DecodedBytes::Bytes(_) => {
                DecodedValue::Ints(head.iter().map(|b| i128::from(*b)).collect())
            }
        };
        return Ok((
            rest,
            Param {
                name: member.name.clone(),
                ty,
                size: member.size,
                val,
                data: head.to_vec(),
                errors: Vec::new(),
            },
        ));
    }

    let width = ty.byte_width();
    let mut rest = bytes;
    let mut values = Vec::with_capacity(member.size);
    for _ in 0..member.size {
        if ty.is_signed() {
            let (r, v) = unpack_int(rest, width)?;
            rest = r;
            values.push(i128::from(v));
        } else {
            let (r, v) = unpack_uint(rest, width)?;
            rest = r;
            values.push(i128::from(v));
        }
    }
    let consumed = member.size * width;
    Ok((
        rest,
        Param {
            name: member.name.clone(),
            ty,
            size: member.size,
            val: DecodedValue::Ints(values),
            data: bytes[..consumed].to_vec(),
            errors: Vec::new(),
        },
    ))
}
