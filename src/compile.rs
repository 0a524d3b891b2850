/* Writer for the precompiled specfile format read by `binary`.
 *
 * Emits the newest supported version: regex engine version and arch tags in
 * the header, the shared stem table, then every spec with its serialized
 * pattern.  Specs that were never compiled get compiled here; the output is
 * written in the store's current order, so a database serialized after
 * sorting reloads into the same order.
 */

use std::io::Write;

use anyhow::{ensure, Result};

use crate::{
    binary::{MAGIC, MAX_VERSION},
    regex,
    store::SpecStore,
};

fn write_u32(out: &mut impl Write, value: u32) -> Result<()> {
    Ok(out.write_all(&value.to_le_bytes())?)
}

fn write_tag(out: &mut impl Write, tag: &str) -> Result<()> {
    write_u32(out, tag.len() as u32)?;
    Ok(out.write_all(tag.as_bytes())?)
}

/// A byte string preceded by its length; `counted_nul` controls whether the
/// length field covers the terminating NUL (spec strings) or not (stems).
fn write_str(out: &mut impl Write, s: &[u8], counted_nul: bool) -> Result<()> {
    let nul = u32::from(counted_nul);
    write_u32(out, s.len() as u32 + nul)?;
    out.write_all(s)?;
    Ok(out.write_all(&[0])?)
}

pub fn write_compiled(store: &SpecStore, out: &mut impl Write) -> Result<()> {
    ensure!(
        !store.stems.is_empty() && !store.specs.is_empty(),
        "refusing to serialize an empty database"
    );

    write_u32(out, MAGIC)?;
    write_u32(out, MAX_VERSION)?;
    write_tag(out, regex::VERSION_TAG)?;
    write_tag(out, regex::arch_tag())?;

    write_u32(out, store.stems.len() as u32)?;
    for id in 0..store.stems.len() {
        write_str(out, store.stems.get(id), false)?;
    }

    write_u32(out, store.specs.len() as u32)?;
    for spec in &store.specs {
        write_str(out, &spec.ctx_raw, true)?;
        write_str(out, &spec.regex_str, true)?;
        write_u32(out, spec.mode.as_mode())?;
        let stem_id = match spec.stem_id {
            Some(id) => id as i32,
            None => -1,
        };
        out.write_all(&stem_id.to_le_bytes())?;
        write_u32(out, u32::from(spec.has_meta_chars))?;
        write_u32(out, spec.prefix_len as u32)?;

        let pattern = spec.ensure_compiled(&store.stems)?;
        let bytes = pattern.to_bytes();
        write_u32(out, bytes.len() as u32)?;
        out.write_all(&bytes)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        binary,
        handle::Environment,
        mmap::MmapArea,
        store::{CmpResult, FileKind},
        text,
    };

    const SPECFILE: &[u8] = b"/tmp(/.*)?       system_u:object_r:tmp_t\n\
                              /tmp/foo         system_u:object_r:foo_t\n\
                              /dev/null  -c    system_u:object_r:null_device_t\n";

    #[test]
    fn test_round_trip() -> Result<()> {
        let env = Environment::default();
        let mut original = SpecStore::default();
        text::process_text_file(&mut original, SPECFILE, "file_contexts", None, false, &env)?;
        original.sort();

        let mut out = vec![];
        write_compiled(&original, &mut out)?;

        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("file_contexts.bin");
        std::fs::write(&path, &out)?;
        let file = std::fs::File::open(&path)?;
        let area = Arc::new(MmapArea::new(&file, out.len() as u64)?);

        let mut reloaded = SpecStore::default();
        binary::load(&mut reloaded, area, "file_contexts.bin", None, false, &env)?;
        reloaded.sort();

        let log: crate::handle::LogFn = Box::new(|_, _| {});
        assert_eq!(original.compare(&reloaded, &log), CmpResult::Equal);

        // deserialized patterns are live without recompiling
        assert!(reloaded.specs.iter().all(|s| s.has_compiled()));
        let hit = reloaded
            .lookup(b"/tmp/bar", FileKind::Regular, false)?
            .unwrap();
        assert_eq!(hit.ctx_raw.as_bytes(), b"system_u:object_r:tmp_t");
        let hit = reloaded
            .lookup(b"/dev/null", FileKind::CharacterDevice, false)?
            .unwrap();
        assert_eq!(hit.ctx_raw.as_bytes(), b"system_u:object_r:null_device_t");
        Ok(())
    }

    #[test]
    fn test_truncated_file_is_rejected() -> Result<()> {
        let env = Environment::default();
        let mut store = SpecStore::default();
        text::process_text_file(&mut store, SPECFILE, "file_contexts", None, false, &env)?;

        let mut out = vec![];
        write_compiled(&store, &mut out)?;
        out.truncate(out.len() - 7);

        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("file_contexts.bin");
        std::fs::write(&path, &out)?;
        let file = std::fs::File::open(&path)?;
        let area = Arc::new(MmapArea::new(&file, out.len() as u64)?);

        let mut reloaded = SpecStore::default();
        assert!(
            binary::load(&mut reloaded, area, "file_contexts.bin", None, false, &env).is_err()
        );
        Ok(())
    }
}
