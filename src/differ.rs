//! Two-file diff front-end.
//!
//! Both inputs are normalised to snapshots, rendered through the printer
//! into temporary files, and handed to an external diff tool whose exit
//! code is propagated. XML inputs are first compiled to a temporary QCN and
//! read back, so the diff reflects the round-trip rather than the text.

use std::io::Write;
use std::path::Path;
use std::process::Command;

use log::debug;
use tempfile::NamedTempFile;

use crate::err::{QcnError, Result};
use crate::loader::{load_input, LoadOptions};
use crate::master;
use crate::model::Snapshot;
use crate::printer::{print_snapshot, PrintOptions};
use crate::qcn::{self, WriterOptions};
use crate::schema::Catalog;
use crate::transform::{build_snapshot, enrich_snapshot};

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub tool: String,
    pub verbose: u8,
}

impl Default for DiffOptions {
    fn default() -> DiffOptions {
        DiffOptions {
            tool: "diff".to_owned(),
            verbose: 0,
        }
    }
}

/// Diffs two inputs after normalisation, returning the diff tool's exit
/// code (0 means identical).
pub fn diff_files(
    a: impl AsRef<Path>,
    b: impl AsRef<Path>,
    catalog: &Catalog,
    load_options: &LoadOptions,
    diff_options: &DiffOptions,
) -> Result<i32> {
    let left = normalise(a.as_ref(), catalog, load_options)?;
    let right = normalise(b.as_ref(), catalog, load_options)?;

    let left_file = render_to_temp(&left, diff_options)?;
    let right_file = render_to_temp(&right, diff_options)?;

    debug!(
        "diffing {} against {} with `{}`",
        left_file.path().display(),
        right_file.path().display(),
        diff_options.tool
    );
    let status = Command::new(&diff_options.tool)
        .arg(left_file.path())
        .arg(right_file.path())
        .status()
        .map_err(|source| QcnError::DiffToolFailed {
            tool: diff_options.tool.clone(),
            source,
        })?;

    Ok(status.code().unwrap_or(-1))
}

/// XML masters are compiled into a scratch QCN and read back; container
/// inputs load directly.
fn normalise(path: &Path, catalog: &Catalog, options: &LoadOptions) -> Result<Snapshot> {
    let is_xml = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase() == "xml")
        .unwrap_or(false);
    if !is_xml {
        return load_input(path, catalog, options);
    }

    let master = master::load_master(path)?;
    let compiled = build_snapshot(catalog, master, &options.transform);

    let scratch = NamedTempFile::new()?;
    qcn::write_qcn(&compiled, scratch.path(), &WriterOptions::default())?;
    let mut snapshot = qcn::read_qcn(scratch.path())?;
    enrich_snapshot(&mut snapshot, catalog);
    Ok(snapshot)
}

fn render_to_temp(snapshot: &Snapshot, options: &DiffOptions) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    print_snapshot(
        &mut file,
        snapshot,
        &PrintOptions {
            verbose: options.verbose,
        },
    )?;
    file.flush()?;
    Ok(file)
}
