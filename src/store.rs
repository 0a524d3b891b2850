/* The specification store: interned stems, the spec array, and the scans
 * that run against them (lookup, duplicate diagnosis, structural compare).
 *
 * Stems, patterns, contexts and lookup keys are raw byte sequences: paths
 * are not UTF-8-constrained and specfile bytes are never decoded.  Interning
 * and comparison are byte-exact with no case folding.
 *
 * After init the store is read-mostly.  The only two mutations a lookup can
 * cause are compiling a pattern into its write-once slot and bumping the
 * per-spec match counter, so concurrent lookups share the store via &self.
 */

use std::{
    borrow::Cow,
    collections::HashMap,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use anyhow::{ensure, Context, Result};

use crate::{
    handle::{LogFn, LogLevel},
    mmap::MmapArea,
    regex::{MatchOutcome, Pattern},
};

/// Reserved context meaning "explicitly no label"; a spec carrying it wins
/// the scan but the lookup reports not-found.
pub const NONE_CONTEXT: &[u8] = b"<<none>>";

/// A byte-string slot that either owns its bytes or borrows them from a
/// mapped specfile.  The mapping stays alive for as long as any borrower
/// does.
pub enum Text {
    Owned(Box<[u8]>),
    Mapped {
        area: Arc<MmapArea>,
        start: usize,
        len: usize,
    },
}

impl Text {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Text::Owned(bytes) => bytes,
            Text::Mapped { area, start, len } => &area.bytes()[*start..*start + *len],
        }
    }
}

impl Deref for Text {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl From<&[u8]> for Text {
    fn from(bytes: &[u8]) -> Text {
        Text::Owned(bytes.into())
    }
}

impl From<&str> for Text {
    fn from(s: &str) -> Text {
        s.as_bytes().into()
    }
}

impl PartialEq for Text {
    fn eq(&self, other: &Text) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl std::fmt::Debug for Text {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&String::from_utf8_lossy(self.as_bytes()), f)
    }
}

/// File-type filter attached to a spec or supplied with a query.
/// `Any` matches every file kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Any,
    BlockDevice,
    CharacterDevice,
    Directory,
    Fifo,
    Symlink,
    Socket,
    Regular,
}

impl FileKind {
    /// The letter used by the text format's `-TYPE` field.
    pub fn from_type_code(code: u8) -> Option<FileKind> {
        Some(match code {
            b'b' => FileKind::BlockDevice,
            b'c' => FileKind::CharacterDevice,
            b'd' => FileKind::Directory,
            b'p' => FileKind::Fifo,
            b'l' => FileKind::Symlink,
            b's' => FileKind::Socket,
            b'-' => FileKind::Regular,
            _ => return None,
        })
    }

    /// The S_IFMT encoding used by the binary format.
    pub fn as_mode(self) -> u32 {
        match self {
            FileKind::Any => 0,
            FileKind::Fifo => 0o010000,
            FileKind::CharacterDevice => 0o020000,
            FileKind::Directory => 0o040000,
            FileKind::BlockDevice => 0o060000,
            FileKind::Regular => 0o100000,
            FileKind::Symlink => 0o120000,
            FileKind::Socket => 0o140000,
        }
    }

    pub fn from_mode(mode: u32) -> Option<FileKind> {
        Some(match mode & 0o170000 {
            0 => FileKind::Any,
            0o010000 => FileKind::Fifo,
            0o020000 => FileKind::CharacterDevice,
            0o040000 => FileKind::Directory,
            0o060000 => FileKind::BlockDevice,
            0o100000 => FileKind::Regular,
            0o120000 => FileKind::Symlink,
            0o140000 => FileKind::Socket,
            _ => return None,
        })
    }
}

/// Outcome of structurally comparing two loaded databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpResult {
    Equal,
    Subset,
    Superset,
    Incomparable,
}

/// Interned leading path components.  Identical byte sequences share one id;
/// the comparison is byte-exact with no case folding.
#[derive(Default)]
pub struct StemTable {
    stems: Vec<Text>,
}

impl StemTable {
    pub fn len(&self) -> usize {
        self.stems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }

    pub fn get(&self, id: usize) -> &[u8] {
        &self.stems[id]
    }

    pub fn find(&self, stem: &[u8]) -> Option<usize> {
        self.stems.iter().position(|s| s.as_bytes() == stem)
    }

    pub fn intern(&mut self, stem: Text) -> usize {
        match self.find(&stem) {
            Some(id) => id,
            None => {
                self.stems.push(stem);
                self.stems.len() - 1
            }
        }
    }

    fn truncate(&mut self, len: usize) {
        self.stems.truncate(len);
    }
}

/// Length of the `/<component>` prefix of a lookup key, if it has one.
pub fn get_stem_from_path(key: &[u8]) -> Option<usize> {
    key.iter()
        .skip(1)
        .position(|&b| b == b'/')
        .map(|pos| pos + 1)
}

/// Collapse runs of consecutive slashes before matching.  The caller's key
/// is left untouched.
pub fn normalize_key(key: &[u8]) -> Cow<'_, [u8]> {
    if !key.windows(2).any(|pair| pair == b"//") {
        return Cow::Borrowed(key);
    }
    let mut clean = Vec::with_capacity(key.len());
    let mut prev_slash = false;
    for &b in key {
        if b == b'/' && prev_slash {
            continue;
        }
        prev_slash = b == b'/';
        clean.push(b);
    }
    Cow::Owned(clean)
}

/// One labeling rule.
pub struct Spec {
    pub regex_str: Text,
    pub ctx_raw: Text,
    pub mode: FileKind,
    pub stem_id: Option<usize>,
    pub has_meta_chars: bool,
    pub prefix_len: usize,
    /// Trailing file-type keyword retained from the text form, for
    /// diagnostics only.
    pub type_str: Option<Box<[u8]>>,
    regex: OnceLock<Option<Pattern>>,
    ctx_trans: OnceLock<Vec<u8>>,
    matches: AtomicU64,
}

impl Spec {
    pub fn new(
        regex_str: Text,
        ctx_raw: Text,
        mode: FileKind,
        stem_id: Option<usize>,
        has_meta_chars: bool,
        prefix_len: usize,
        type_str: Option<Box<[u8]>>,
    ) -> Spec {
        Spec {
            regex_str,
            ctx_raw,
            mode,
            stem_id,
            has_meta_chars,
            prefix_len,
            type_str,
            regex: OnceLock::new(),
            ctx_trans: OnceLock::new(),
            matches: AtomicU64::new(0),
        }
    }

    /// Attach a pattern deserialized from a precompiled specfile.  Once a
    /// compiled pattern is in the slot it is never replaced.
    pub(crate) fn attach_compiled(&self, pattern: Pattern) {
        let _ = self.regex.set(Some(pattern));
    }

    pub(crate) fn has_compiled(&self) -> bool {
        matches!(self.regex.get(), Some(Some(..)))
    }

    pub(crate) fn compiled_pattern(&self) -> Option<&Pattern> {
        self.regex.get().and_then(|slot| slot.as_ref())
    }

    /// Compile-on-first-use.  A compile failure is reported to the caller
    /// that hit it and recorded, so later scans skip this spec instead of
    /// paying for the same failure again.
    fn compiled(&self, stems: &StemTable) -> Result<Option<&Pattern>> {
        if self.regex.get().is_none() {
            let raw = self.regex_str.as_bytes();
            let pattern = match self.stem_id {
                Some(id) => &raw[stems.get(id).len()..],
                None => raw,
            };
            match Pattern::compile(pattern) {
                Ok(compiled) => {
                    let _ = self.regex.set(Some(compiled));
                }
                Err(err) => {
                    let _ = self.regex.set(None);
                    return Err(err);
                }
            }
        }
        Ok(self.regex.get().and_then(|slot| slot.as_ref()))
    }

    /// Compile now if still pending; serialization needs the compiled form.
    pub(crate) fn ensure_compiled(&self, stems: &StemTable) -> Result<&Pattern> {
        self.compiled(stems)?.with_context(|| {
            format!(
                "pattern {} failed to compile earlier",
                String::from_utf8_lossy(&self.regex_str)
            )
        })
    }

    pub fn match_count(&self) -> u64 {
        self.matches.load(Ordering::Relaxed)
    }

    /// The context to hand back on a hit, run through the translation hook
    /// the first time it is asked for.
    pub(crate) fn context(
        &self,
        translate: Option<&(dyn Fn(&[u8]) -> Vec<u8> + Send + Sync)>,
    ) -> &[u8] {
        match translate {
            None => self.ctx_raw.as_bytes(),
            Some(f) => self.ctx_trans.get_or_init(|| f(self.ctx_raw.as_bytes())),
        }
    }
}

/// Marks the store lengths before a specfile is consumed, so a file that
/// fails mid-load can be backed out before the alternate candidate is tried.
#[derive(Clone, Copy)]
pub struct StoreMark {
    nspec: usize,
    nstem: usize,
}

#[derive(Default)]
pub struct SpecStore {
    pub specs: Vec<Spec>,
    pub stems: StemTable,
}

impl SpecStore {
    pub fn mark(&self) -> StoreMark {
        StoreMark {
            nspec: self.specs.len(),
            nstem: self.stems.len(),
        }
    }

    pub fn rollback(&mut self, mark: StoreMark) {
        self.specs.truncate(mark.nspec);
        self.stems.truncate(mark.nstem);
    }

    /// Stable partition: specs with metacharacters first, exact pathnames
    /// last, original append order preserved within each region.  The
    /// reverse scan in lookup() then visits exact matches first, and later
    /// rules keep overriding earlier ones within each region.
    pub fn sort(&mut self) {
        self.specs.sort_by_key(|spec| !spec.has_meta_chars);
    }

    /// Diagnose rules that share a pattern and overlap in mode.  Only called
    /// when the handle is validating, in which case any duplicate is fatal.
    pub fn check_duplicates(&self, path: &str, log: &LogFn) -> Result<()> {
        let mut by_pattern: HashMap<&[u8], Vec<&Spec>> = HashMap::new();
        let mut ndups = 0usize;

        for spec in &self.specs {
            let earlier = by_pattern.entry(spec.regex_str.as_bytes()).or_default();
            for prev in earlier.iter() {
                if prev.mode != spec.mode
                    && prev.mode != FileKind::Any
                    && spec.mode != FileKind::Any
                {
                    continue;
                }
                ndups += 1;
                if prev.ctx_raw != spec.ctx_raw {
                    log(
                        LogLevel::Error,
                        &format!(
                            "{}: multiple different specifications for {} ({} and {})",
                            path,
                            String::from_utf8_lossy(&spec.regex_str),
                            String::from_utf8_lossy(&prev.ctx_raw),
                            String::from_utf8_lossy(&spec.ctx_raw)
                        ),
                    );
                } else {
                    log(
                        LogLevel::Error,
                        &format!(
                            "{}: multiple same specifications for {}",
                            path,
                            String::from_utf8_lossy(&spec.regex_str)
                        ),
                    );
                }
            }
            earlier.push(spec);
        }

        ensure!(ndups == 0, "{path}: {ndups} duplicate specification(s)");
        Ok(())
    }

    /// Reverse scan so that the last matching specification wins.  With
    /// `partial` set, a spec whose pattern could still match a descendant of
    /// the key also terminates the scan.
    pub fn lookup(&self, key: &[u8], kind: FileKind, partial: bool) -> Result<Option<&Spec>> {
        if self.specs.is_empty() {
            return Ok(None);
        }

        let key = normalize_key(key);
        let key = key.as_ref();

        let (key_stem, tail) = match get_stem_from_path(key) {
            Some(len) => (self.stems.find(&key[..len]), &key[len..]),
            None => (None, key),
        };

        for spec in self.specs.iter().rev() {
            let subject: &[u8] = match (spec.stem_id, key_stem) {
                (None, _) => key,
                (Some(id), Some(key_id)) if id == key_id => tail,
                (Some(_), Some(_)) => continue,
                // The key is a single component, so it carries no stem of
                // its own, but a descendant of it would.  For the partial
                // probe a spec stemmed on exactly the key is still a
                // candidate, with everything after the stem left to match.
                (Some(id), None) => {
                    if partial && self.stems.get(id) == key {
                        &[]
                    } else {
                        continue;
                    }
                }
            };
            if kind != FileKind::Any && spec.mode != FileKind::Any && spec.mode != kind {
                continue;
            }

            let Some(regex) = spec.compiled(&self.stems)? else {
                // compile failed on an earlier scan
                continue;
            };

            match regex.matches(subject, partial)? {
                MatchOutcome::Match => {
                    spec.matches.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.won(spec));
                }
                MatchOutcome::Partial => return Ok(self.won(spec)),
                MatchOutcome::NoMatch => continue,
            }
        }

        Ok(None)
    }

    fn won<'a>(&self, spec: &'a Spec) -> Option<&'a Spec> {
        if spec.ctx_raw.as_bytes() == NONE_CONTEXT {
            None
        } else {
            Some(spec)
        }
    }

    /// Lockstep walk of two sorted stores.  Exact-path specs sit at the
    /// tail, so one side may carry extra regex entries the other lacks;
    /// those are skipped and remembered for the verdict.
    pub fn compare(&self, other: &SpecStore, log: &LogFn) -> CmpResult {
        let (nspec1, nspec2) = (self.specs.len(), other.specs.len());
        let (mut i, mut j) = (0, 0);
        let (mut skipped1, mut skipped2) = (false, false);

        let incomp = |reason: &str, spec1: &Spec, spec2: &Spec, i: usize, j: usize| {
            log(
                LogLevel::Info,
                &format!(
                    "compare: mismatched {} on entry {}: ({}, {:?}, {}) vs entry {}: ({}, {:?}, {})",
                    reason,
                    i,
                    String::from_utf8_lossy(&spec1.regex_str),
                    spec1.mode,
                    String::from_utf8_lossy(&spec1.ctx_raw),
                    j,
                    String::from_utf8_lossy(&spec2.regex_str),
                    spec2.mode,
                    String::from_utf8_lossy(&spec2.ctx_raw)
                ),
            );
            CmpResult::Incomparable
        };

        while i < nspec1 && j < nspec2 {
            let spec1 = &self.specs[i];
            let spec2 = &other.specs[j];

            if !spec1.has_meta_chars && spec2.has_meta_chars {
                j += 1;
                skipped2 = true;
                continue;
            }
            if spec1.has_meta_chars && !spec2.has_meta_chars {
                i += 1;
                skipped1 = true;
                continue;
            }

            match (spec1.compiled_pattern(), spec2.compiled_pattern()) {
                (Some(re1), Some(re2)) => {
                    if !re1.same_as(re2) {
                        return incomp("regex", spec1, spec2, i, j);
                    }
                }
                _ => {
                    if spec1.regex_str != spec2.regex_str {
                        return incomp("regex_str", spec1, spec2, i, j);
                    }
                }
            }

            if spec1.mode != spec2.mode {
                return incomp("mode", spec1, spec2, i, j);
            }

            match (spec1.stem_id, spec2.stem_id) {
                (None, None) => {}
                (Some(id1), Some(id2)) => {
                    if self.stems.get(id1) != other.stems.get(id2) {
                        return incomp("stem", spec1, spec2, i, j);
                    }
                }
                _ => return incomp("stem_id", spec1, spec2, i, j),
            }

            if spec1.ctx_raw != spec2.ctx_raw {
                return incomp("ctx_raw", spec1, spec2, i, j);
            }

            i += 1;
            j += 1;
        }

        if (skipped1 || i < nspec1) && !skipped2 {
            CmpResult::Superset
        } else if (skipped2 || j < nspec2) && !skipped1 {
            CmpResult::Subset
        } else if skipped1 && skipped2 {
            CmpResult::Incomparable
        } else {
            CmpResult::Equal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(pattern: &[u8], has_meta: bool) -> Spec {
        Spec::new(
            pattern.into(),
            "system_u:object_r:test_t".into(),
            FileKind::Any,
            None,
            has_meta,
            pattern.len(),
            None,
        )
    }

    #[test]
    fn test_sort_partitions_exact_specs_last() {
        let mut store = SpecStore::default();
        store.specs.push(spec(b"/a/one", false));
        store.specs.push(spec(b"/b(/.*)?", true));
        store.specs.push(spec(b"/a/two", false));
        store.specs.push(spec(b"/c/.*", true));
        store.sort();

        let order: Vec<&[u8]> = store.specs.iter().map(|s| s.regex_str.as_bytes()).collect();
        assert_eq!(order, [&b"/b(/.*)?"[..], b"/c/.*", b"/a/one", b"/a/two"]);

        // once an exact spec is seen, everything after it is exact too
        let mut seen_exact = false;
        for s in &store.specs {
            if !s.has_meta_chars {
                seen_exact = true;
            }
            assert!(!seen_exact || !s.has_meta_chars);
        }
    }

    #[test]
    fn test_stem_interning() {
        let mut stems = StemTable::default();
        let a = stems.intern(b"/usr".as_slice().into());
        let b = stems.intern(b"/var".as_slice().into());
        let c = stems.intern(b"/usr".as_slice().into());
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(stems.len(), 2);
        assert_eq!(stems.get(b), b"/var");
        assert_eq!(stems.find(b"/tmp"), None);
    }

    #[test]
    fn test_stems_are_byte_exact() {
        let mut stems = StemTable::default();
        // a stem need not be UTF-8, and case matters
        let raw = stems.intern(b"/caf\xe9".as_slice().into());
        let upper = stems.intern(b"/CAF\xe9".as_slice().into());
        assert_ne!(raw, upper);
        assert_eq!(stems.find(b"/caf\xe9"), Some(raw));
        assert_eq!(stems.find(b"/caf\xc3\xa9"), None);
    }

    #[test]
    fn test_stem_from_path() {
        assert_eq!(get_stem_from_path(b"/usr/bin/ls"), Some(4));
        assert_eq!(get_stem_from_path(b"/usr"), None);
        assert_eq!(get_stem_from_path(b"/"), None);
        assert_eq!(get_stem_from_path(b""), None);
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key(b"/a/b/c").as_ref(), b"/a/b/c");
        assert_eq!(normalize_key(b"/a//b///c").as_ref(), b"/a/b/c");
        assert_eq!(normalize_key(b"//a").as_ref(), b"/a");
        assert!(matches!(normalize_key(b"/a/b"), Cow::Borrowed(..)));
    }

    #[test]
    fn test_duplicate_diagnosis() {
        let log: LogFn = Box::new(|_, _| {});

        let mut store = SpecStore::default();
        store.specs.push(spec(b"/etc/fstab", false));
        store.specs.push(spec(b"/etc/fstab", false));
        assert!(store.check_duplicates("file_contexts", &log).is_err());

        // same pattern, disjoint modes: not a duplicate
        let mut store = SpecStore::default();
        let mut a = spec(b"/dev/null", false);
        a.mode = FileKind::CharacterDevice;
        let mut b = spec(b"/dev/null", false);
        b.mode = FileKind::Regular;
        store.specs.push(a);
        store.specs.push(b);
        assert!(store.check_duplicates("file_contexts", &log).is_ok());

        // Any overlaps every mode
        let mut store = SpecStore::default();
        let mut a = spec(b"/dev/null", false);
        a.mode = FileKind::CharacterDevice;
        store.specs.push(a);
        store.specs.push(spec(b"/dev/null", false));
        assert!(store.check_duplicates("file_contexts", &log).is_err());
    }

    #[test]
    fn test_mode_round_trip() {
        for kind in [
            FileKind::Any,
            FileKind::BlockDevice,
            FileKind::CharacterDevice,
            FileKind::Directory,
            FileKind::Fifo,
            FileKind::Symlink,
            FileKind::Socket,
            FileKind::Regular,
        ] {
            assert_eq!(FileKind::from_mode(kind.as_mode()), Some(kind));
        }
        assert_eq!(FileKind::from_mode(0o030000), None);
    }
}
