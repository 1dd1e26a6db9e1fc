use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QcnError>;

/// Fatal errors: container-format violations and I/O abort the current
/// command. Everything recoverable is a [`Diagnostic`] instead.
#[derive(Debug, Error)]
pub enum QcnError {
    #[error("An I/O error has occurred")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Failed to open file {}", path.display())]
    FailedToOpenFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("Malformed XML in {}: {source}", path.display())]
    Xml {
        source: quick_xml::Error,
        path: PathBuf,
    },

    #[error("Offset {offset}: {t} failed a structural check: {message}")]
    FailedStructuralCheck {
        t: &'static str,
        offset: u64,
        message: String,
    },

    #[error("Invalid ELF magic, expected `7f454c46`, found `{magic:02x?}`")]
    InvalidElfMagic { magic: [u8; 4] },

    #[error("ELF class {class} is not ELFCLASS32")]
    NotElf32 { class: u8 },

    #[error("ELF data encoding {encoding} is not little-endian")]
    NotLittleEndianElf { encoding: u8 },

    #[error("No PT_LOAD segment in program header table")]
    NoLoadSegment,

    #[error("Invalid MCFG magic, expected `0x4753434d`, found `{found:#010x}`")]
    InvalidMcfgMagic { found: u32 },

    #[error("MCFG format version {version} is above the supported ceiling {ceiling}")]
    UnsupportedMcfgVersion { version: u16, ceiling: u16 },

    #[error("Numbered item {id} payload is {len} bytes, the packet payload limit is {limit}")]
    PayloadTooLarge { id: u32, len: usize, limit: usize },

    #[error("Unrecognized input extension for `{}`: expected .qcn, .xml or .mbn", path.display())]
    UnrecognizedExtension { path: PathBuf },

    #[error("Failed to launch diff tool `{tool}`")]
    DiffToolFailed { tool: String, source: std::io::Error },
}

impl QcnError {
    pub fn structural(t: &'static str, offset: u64, message: impl Into<String>) -> Self {
        QcnError::FailedStructuralCheck {
            t,
            offset,
            message: message.into(),
        }
    }
}

/// Per-item diagnostics. These are collected into the owning value's error
/// list and never abort a command; emission continues with best-effort bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Diagnostic {
    #[error("missing schema!")]
    MissingSchema,

    #[error("schema error: {0}")]
    Schema(String),

    #[error("unknown type `{0}`")]
    UnknownType(String),

    #[error("unknown encoding `{0}`")]
    UnknownEncoding(String),

    #[error("parameter {0} not a number")]
    NotANumber(String),

    #[error("mismatch between {declared} declared, {defined} defined elements")]
    LengthMismatch { declared: usize, defined: usize },

    #[error("only one string element allowed")]
    StringWithSiblings,

    #[error("value {value} out of range for {bits}-bit {}", if *signed { "signed" } else { "unsigned" })]
    OutOfRange { bits: u8, value: i128, signed: bool },

    #[error("{t}: need {need} bytes, have {have}")]
    Truncated {
        t: &'static str,
        need: usize,
        have: usize,
    },

    #[error("error in {member}: {source}")]
    InMember {
        member: String,
        source: Box<Diagnostic>,
    },
}

impl Diagnostic {
    /// Wraps a member-level diagnostic with the member name, matching the
    /// `error in <name>: ...` rendering of aggregated item errors.
    pub fn in_member(member: impl Into<String>, inner: Diagnostic) -> Self {
        Diagnostic::InMember {
            member: member.into(),
            source: Box::new(inner),
        }
    }
}
