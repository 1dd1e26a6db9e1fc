#![deny(unused_must_use)]
#![forbid(unsafe_code)]
// Don't allow dbg! prints in release.
#![cfg_attr(not(debug_assertions), deny(clippy::dbg_macro))]

//! Schema-driven codec for Qualcomm radio calibration configurations.
//!
//! Three wire formats meet one in-memory model: the vendor NV-definition
//! XML dialect (schema plus master value file), the QCN compound-file
//! container, and the MBN (ELF32 + MCFG) carrier image. Any input can be
//! printed or compiled to any output, and two inputs diff regardless of
//! format.

pub use loader::{load_input, LoadOptions};
pub use model::{
    DecodedValue, EfsStore, EfsValue, Encoding, FileVersion, ItemKey, MemberValue,
    MobilePropertyInfo, NumberedValue, Param, Snapshot, ValueShape,
};
pub use schema::{Catalog, EfsItem, Member, MemberType, NumberedItem, PrimType, SchemaOptions, SubstDepth};

pub mod codec;
pub mod differ;
pub mod err;
pub mod loader;
pub mod marshal;
pub mod master;
pub mod mbn;
pub mod model;
pub mod printer;
pub mod qcn;
pub mod schema;
pub mod transform;
pub mod update_script;

// For tests, we only initialize logging once.
#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
#[cfg(test)]
pub fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}
