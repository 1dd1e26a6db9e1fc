//! Input dispatch: every file argument resolves to a snapshot through the
//! loader its extension names.

use std::path::Path;

use log::debug;

use crate::err::{QcnError, Result};
use crate::master;
use crate::mbn;
use crate::model::Snapshot;
use crate::qcn;
use crate::schema::Catalog;
use crate::transform::{build_snapshot, enrich_snapshot, TransformOptions};

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub transform: TransformOptions,
}

pub fn load_input(path: impl AsRef<Path>, catalog: &Catalog, options: &LoadOptions) -> Result<Snapshot> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    debug!("loading {} as .{extension}", path.display());
    match extension.as_str() {
        "qcn" => {
            let mut snapshot = qcn::read_qcn(path)?;
            enrich_snapshot(&mut snapshot, catalog);
            Ok(snapshot)
        }
        "mbn" => {
            let mut snapshot = mbn::read_mbn(path)?;
            enrich_snapshot(&mut snapshot, catalog);
            Ok(snapshot)
        }
        "xml" => {
            let master = master::load_master(path)?;
            Ok(build_snapshot(catalog, master, &options.transform))
        }
        _ => Err(QcnError::UnrecognizedExtension {
            path: path.to_path_buf(),
        }),
    }
}
