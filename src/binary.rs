/* Reader for the precompiled specfile format.
 *
 * The file is mapped read-only and decoded as a little-endian stream with no
 * alignment guarantees.  Context and pattern strings are not copied out: a
 * spec's string slots borrow straight from the mapping, which stays mapped
 * until the last borrower is dropped.
 *
 * Layout:
 *
 *   u32 magic, u32 version
 *   version >= 2: u32 len, regex engine version tag (must match the host)
 *   version >= 5: u32 len, regex arch tag (mismatch is non-fatal: the
 *                 serialized pattern bodies are skipped and patterns
 *                 recompile lazily from their text)
 *   u32 stem_count, then per stem: u32 len, bytes, NUL
 *   u32 spec_count, then per spec:
 *     u32 len, context (NUL included in len)
 *     u32 len, pattern text (NUL included in len)
 *     u32 mode, i32 stem id (-1 for none), u32 has_meta_chars
 *     version >= 4: u32 prefix_len
 *     u32 len, serialized pattern
 */

use std::sync::Arc;

use anyhow::{ensure, Context, Result};

use crate::{
    handle::Environment,
    mmap::MmapArea,
    regex::{self, Pattern},
    store::{FileKind, Spec, SpecStore, Text, NONE_CONTEXT},
};

pub const MAGIC: u32 = 0xF97C_FF8A;

/// Header carries the regex engine version tag from this version on.
pub const VERS_REGEX_VERSION: u32 = 2;
/// Mode is a fixed 32-bit field from this version on (the native mode_t
/// width before that, which is also 32 bits on every target we support).
pub const VERS_MODE_U32: u32 = 3;
pub const VERS_PREFIX_LEN: u32 = 4;
pub const VERS_REGEX_ARCH: u32 = 5;
pub const MAX_VERSION: u32 = VERS_REGEX_ARCH;

struct Reader {
    area: Arc<MmapArea>,
    pos: usize,
}

impl Reader {
    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.area.bytes().len())
            .with_context(|| format!("truncated specfile at offset {start}"))?;
        self.pos = end;
        Ok(&self.area.bytes()[start..end])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into()?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes: [u8; 4] = self.take(4)?.try_into()?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// A string of `len` bytes followed by a required NUL, handed out as a
    /// borrow of the mapping.  The bytes are not decoded.
    fn text(&mut self, len: usize) -> Result<Text> {
        let start = self.pos;
        let bytes = self.take(len + 1)?;
        ensure!(
            bytes[len] == 0,
            "string at offset {start} is not NUL-terminated"
        );
        Ok(Text::Mapped {
            area: self.area.clone(),
            start,
            len,
        })
    }

    /// A string whose length field counts the trailing NUL.
    fn text_counted_nul(&mut self, len: usize) -> Result<Text> {
        ensure!(len > 0, "empty string field at offset {}", self.pos);
        self.text(len - 1)
    }
}

pub fn load(
    store: &mut SpecStore,
    area: Arc<MmapArea>,
    path: &str,
    subset: Option<&[u8]>,
    validating: bool,
    env: &Environment,
) -> Result<()> {
    let mut r = Reader { area, pos: 0 };

    ensure!(r.u32()? == MAGIC, "{path}: not a compiled specfile");
    let version = r.u32()?;
    ensure!(
        (1..=MAX_VERSION).contains(&version),
        "{path}: unsupported specfile version {version}"
    );

    let mut arch_ok = true;
    if version >= VERS_REGEX_VERSION {
        let len = r.u32()? as usize;
        let tag = r.take(len)?;
        ensure!(
            tag == regex::VERSION_TAG.as_bytes(),
            "{path}: compiled against a different regex engine"
        );

        if version >= VERS_REGEX_ARCH {
            let len = r.u32()? as usize;
            // a foreign arch is fine: patterns recompile from text
            arch_ok = r.take(len)? == regex::arch_tag().as_bytes();
        }
    }

    let stem_count = r.u32()?;
    ensure!(stem_count > 0, "{path}: no stem table");
    // maps stem ids local to this file onto the shared table
    let mut stem_map = Vec::with_capacity(stem_count as usize);
    for _ in 0..stem_count {
        let len = r.u32()? as usize;
        ensure!(len > 0, "{path}: empty stem");
        let stem = r.text(len)?;
        stem_map.push(store.stems.intern(stem));
    }

    let spec_count = r.u32()?;
    ensure!(spec_count > 0, "{path}: no specifications");
    for _ in 0..spec_count {
        let len = r.u32()? as usize;
        let ctx = r.text_counted_nul(len)?;

        if validating && ctx.as_bytes() != NONE_CONTEXT {
            if let Some(validate) = &env.validate {
                ensure!(
                    validate(&ctx),
                    "{path}: context {} is invalid",
                    String::from_utf8_lossy(&ctx)
                );
            }
        }

        let len = r.u32()? as usize;
        let regex_str = r.text_counted_nul(len)?;

        let mode = r.u32()?;
        let kind = FileKind::from_mode(mode).with_context(|| {
            format!(
                "{path}: bad mode {mode:#o} for {}",
                String::from_utf8_lossy(&regex_str)
            )
        })?;

        let stem_local = r.i32()?;
        let stem_id = usize::try_from(stem_local)
            .ok()
            .filter(|&id| id < stem_map.len())
            .map(|id| stem_map[id]);

        let has_meta_chars = r.u32()? != 0;
        let prefix_len = if version >= VERS_PREFIX_LEN {
            r.u32()? as usize
        } else {
            0
        };

        let regex_len = r.u32()? as usize;
        let regex_bytes = r.take(regex_len)?;

        if let (Some(prefix), Some(id)) = (subset, stem_id) {
            if !prefix.starts_with(store.stems.get(id)) {
                continue;
            }
        }

        let spec = Spec::new(
            regex_str,
            ctx,
            kind,
            stem_id,
            has_meta_chars,
            prefix_len,
            None,
        );
        if arch_ok && regex_len > 0 {
            let pattern = Pattern::from_bytes(regex_bytes)
                .with_context(|| format!("{path}: bad serialized pattern"))?;
            spec.attach_compiled(pattern);
        }
        store.specs.push(spec);
    }

    Ok(())
}
