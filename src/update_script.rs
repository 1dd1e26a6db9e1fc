//! Update-script emission: one `nvimgr` invocation per item, byte payloads
//! split across backslash continuation lines.

use std::io::{self, Write};

use crate::model::{EfsValue, ItemKey, Snapshot};

const BYTES_PER_LINE: usize = 16;

pub fn write_update_script<W: Write>(out: &mut W, snapshot: &Snapshot) -> io::Result<()> {
    for value in snapshot.numbered.values() {
        let empty = Vec::new();
        let data = value.data.as_ref().unwrap_or(&empty);
        write_item(out, &ItemKey::Id(value.id), data)?;
    }

    let mut efs: Vec<&EfsValue> = snapshot
        .stores()
        .iter()
        .flat_map(|(_, store)| store.values())
        .collect();
    efs.sort_by_key(|value| value.path.to_lowercase());
    for value in efs {
        let empty = Vec::new();
        let data = value.data.as_ref().unwrap_or(&empty);
        write_item(out, &ItemKey::Path(value.path.clone()), data)?;
    }
    Ok(())
}

/// Every line but the last continues with a backslash; the item ends with a
/// blank line. Consumers accept arbitrarily many continuation lines.
fn write_item<W: Write>(out: &mut W, item: &ItemKey, data: &[u8]) -> io::Result<()> {
    if data.is_empty() {
        writeln!(out, "nvimgr --item {item} 0")?;
        return writeln!(out);
    }

    writeln!(out, "nvimgr --item {item} {} \\", data.len())?;
    let mut chunks = data.chunks(BYTES_PER_LINE).peekable();
    while let Some(chunk) = chunks.next() {
        let rendered: Vec<String> = chunk.iter().map(u8::to_string).collect();
        if chunks.peek().is_some() {
            writeln!(out, "    {} \\", rendered.join(" "))?;
        } else {
            writeln!(out, "    {}", rendered.join(" "))?;
        }
    }
    writeln!(out)
}
