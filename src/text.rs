/* Parser for the line-oriented specfile format:
 *
 *   PATTERN [ -TYPE ] CONTEXT
 *
 * '#' starts a comment, blank lines are skipped, fields are separated by
 * runs of whitespace.  The file is UTF-8 tolerant: bytes are never decoded,
 * so patterns, contexts and the paths they match may carry arbitrary bytes.
 * Patterns are analyzed here for their literal prefix (best-match
 * tie-breaking), their leading stem (lookup bucketing) and the presence of
 * metacharacters (exact-path ordering); compilation itself is deferred
 * until a lookup first needs the pattern.
 */

use anyhow::{bail, ensure, Context, Result};

use crate::{
    handle::Environment,
    store::{FileKind, Spec, SpecStore, NONE_CONTEXT},
};

const META_CHARS: &[u8] = b".^$?*+|[({";

/// Whitespace-separated fields of one line.
pub(crate) fn fields(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|b: &u8| b.is_ascii_whitespace())
        .filter(|field| !field.is_empty())
}

/// What the literal-prefix walk learned about a pattern.
pub struct PatternInfo {
    /// Literal prefix with escapes stripped.
    pub literal: Vec<u8>,
    pub has_meta_chars: bool,
    /// Leading `/<component>` of the literal prefix, present only when the
    /// component is escape-free so the stem bytes equal the raw pattern
    /// bytes they replace.
    pub stem: Option<Vec<u8>>,
}

pub fn analyze_pattern(pattern: &[u8]) -> Result<PatternInfo> {
    let mut literal = Vec::new();
    let mut has_meta_chars = false;
    let mut stem = None;
    let mut escape_seen = false;

    let mut i = 0;
    while i < pattern.len() {
        let b = pattern[i];
        if b == b'\\' {
            ensure!(i + 1 < pattern.len(), "pattern ends with a dangling escape");
            escape_seen = true;
            literal.push(pattern[i + 1]);
            i += 2;
            continue;
        }
        if META_CHARS.contains(&b) {
            has_meta_chars = true;
            break;
        }
        if b == b'/'
            && stem.is_none()
            && !escape_seen
            && literal.len() > 1
            && literal.first() == Some(&b'/')
        {
            stem = Some(literal.clone());
        }
        literal.push(b);
        i += 1;
    }

    Ok(PatternInfo {
        literal,
        has_meta_chars,
        stem,
    })
}

fn process_line(
    store: &mut SpecStore,
    line: &[u8],
    path: &str,
    lineno: usize,
    subset: Option<&[u8]>,
    validating: bool,
    env: &Environment,
) -> Result<()> {
    let mut parts = fields(line);
    let regex = match parts.next() {
        None => return Ok(()), // empty line or line with only whitespace
        Some(comment) if comment.first() == Some(&b'#') => return Ok(()),
        Some(regex) => regex,
    };

    let Some(next) = parts.next() else {
        bail!("{path}:{lineno}: missing context field");
    };
    let (mode, type_str, context) = if let Some(code) = next.strip_prefix(b"-") {
        let kind = match code {
            &[code] => FileKind::from_type_code(code),
            _ => None,
        };
        let Some(kind) = kind else {
            bail!(
                "{path}:{lineno}: invalid type code -{}",
                String::from_utf8_lossy(code)
            );
        };
        let Some(context) = parts.next() else {
            bail!("{path}:{lineno}: missing context field");
        };
        (kind, Some(next), context)
    } else {
        (FileKind::Any, None, next)
    };
    ensure!(parts.next().is_none(), "{path}:{lineno}: trailing data");

    let info = analyze_pattern(regex).with_context(|| format!("{path}:{lineno}"))?;

    // Subset loading: only keep rules whose stem the requested prefix
    // starts with.  Stemless rules always stay.
    if let (Some(prefix), Some(stem)) = (subset, info.stem.as_deref()) {
        if !prefix.starts_with(stem) {
            return Ok(());
        }
    }

    if validating && context != NONE_CONTEXT {
        if let Some(validate) = &env.validate {
            ensure!(
                validate(context),
                "{path}:{lineno}: context {} is invalid",
                String::from_utf8_lossy(context)
            );
        }
    }

    let stem_id = info
        .stem
        .map(|stem| store.stems.intern(stem.as_slice().into()));
    store.specs.push(Spec::new(
        regex.into(),
        context.into(),
        mode,
        stem_id,
        info.has_meta_chars,
        info.literal.len(),
        type_str.map(Box::from),
    ));
    Ok(())
}

pub fn process_text_file(
    store: &mut SpecStore,
    contents: &[u8],
    path: &str,
    subset: Option<&[u8]>,
    validating: bool,
    env: &Environment,
) -> Result<()> {
    for (idx, line) in contents.split(|&b| b == b'\n').enumerate() {
        process_line(store, line, path, idx + 1, subset, validating, env)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SpecStore;

    fn load(contents: &[u8]) -> Result<SpecStore> {
        let mut store = SpecStore::default();
        process_text_file(
            &mut store,
            contents,
            "file_contexts",
            None,
            false,
            &Environment::default(),
        )?;
        Ok(store)
    }

    #[test]
    fn test_analyze_pattern() -> Result<()> {
        let info = analyze_pattern(b"/usr/bin/ls")?;
        assert_eq!(info.literal, b"/usr/bin/ls");
        assert!(!info.has_meta_chars);
        assert_eq!(info.stem.as_deref(), Some(b"/usr".as_slice()));

        // the first component carries a metacharacter: no stem
        let info = analyze_pattern(b"/tmp(/.*)?")?;
        assert_eq!(info.literal, b"/tmp");
        assert!(info.has_meta_chars);
        assert_eq!(info.stem, None);

        let info = analyze_pattern(b"/usr/(local/)?bin")?;
        assert_eq!(info.literal, b"/usr/");
        assert!(info.has_meta_chars);
        assert_eq!(info.stem.as_deref(), Some(b"/usr".as_slice()));

        // escaped metacharacters are literal text
        let info = analyze_pattern(br"/etc/motd\.d/.*")?;
        assert_eq!(info.literal, b"/etc/motd.d/");
        assert!(info.has_meta_chars);
        assert_eq!(info.stem.as_deref(), Some(b"/etc".as_slice()));

        assert!(analyze_pattern(br"/etc/broken\").is_err());
        Ok(())
    }

    #[test]
    fn test_fields_and_types() -> Result<()> {
        let store = load(
            b"# comment\n\
              \n\
              /dev/null        -c    system_u:object_r:null_device_t\n\
              /dev/.*          system_u:object_r:device_t\n\
              /dev/md[0-9]+    -b    system_u:object_r:fixed_disk_t\n",
        )?;
        assert_eq!(store.specs.len(), 3);
        assert_eq!(store.specs[0].mode, FileKind::CharacterDevice);
        assert_eq!(store.specs[0].type_str.as_deref(), Some(b"-c".as_slice()));
        assert!(!store.specs[0].has_meta_chars);
        assert_eq!(store.specs[1].mode, FileKind::Any);
        assert!(store.specs[1].has_meta_chars);
        assert_eq!(store.specs[2].mode, FileKind::BlockDevice);
        // all three share the /dev stem
        assert_eq!(store.stems.len(), 1);
        assert_eq!(store.specs[0].stem_id, store.specs[1].stem_id);
        Ok(())
    }

    #[test]
    fn test_bytes_are_not_decoded() -> Result<()> {
        // latin-1 bytes in pattern and context survive untouched
        let store = load(b"/caf\xe9/menu   system_u:object_r:caf\xe9_t\n")?;
        assert_eq!(store.specs[0].regex_str.as_bytes(), b"/caf\xe9/menu");
        assert_eq!(store.specs[0].ctx_raw.as_bytes(), b"system_u:object_r:caf\xe9_t");
        assert_eq!(store.specs[0].stem_id.map(|id| store.stems.get(id)), Some(b"/caf\xe9".as_slice()));
        Ok(())
    }

    #[test]
    fn test_prefix_len() -> Result<()> {
        let store = load(b"/var/www(/.*)?   system_u:object_r:httpd_content_t\n")?;
        assert_eq!(store.specs[0].prefix_len, b"/var/www".len());
        Ok(())
    }

    #[test]
    fn test_malformed_lines() {
        assert!(load(b"/tmp\n").is_err());
        assert!(load(b"/tmp -q ctx\n").is_err());
        assert!(load(b"/tmp -dd ctx\n").is_err());
        assert!(load(b"/tmp - ctx\n").is_err());
        assert!(load(b"/tmp -d ctx extra\n").is_err());
    }

    #[test]
    fn test_subset_filter() -> Result<()> {
        let mut store = SpecStore::default();
        process_text_file(
            &mut store,
            b"/etc/hosts   system_u:object_r:etc_t\n\
              /var/spool(/.*)?   system_u:object_r:spool_t\n\
              /.*          system_u:object_r:default_t\n",
            "file_contexts",
            Some(b"/etc/httpd"),
            false,
            &Environment::default(),
        )?;
        // /var is filtered out, the stemless catch-all survives
        let patterns: Vec<&[u8]> = store.specs.iter().map(|s| s.regex_str.as_bytes()).collect();
        assert_eq!(patterns, [&b"/etc/hosts"[..], b"/.*"]);
        Ok(())
    }

    #[test]
    fn test_invalid_context_hook() {
        let env = Environment {
            validate: Some(Box::new(|ctx: &[u8]| ctx.contains(&b':'))),
            ..Environment::default()
        };
        let mut store = SpecStore::default();
        let err = process_text_file(
            &mut store,
            b"/etc/hosts   not-a-context\n",
            "file_contexts",
            None,
            true,
            &env,
        );
        assert!(err.is_err());
    }
}
