/* The loaded database handle.
 *
 * Init discovers and consumes the specfile set (each base path, then the
 * `.homedirs` and `.local` auxiliaries unless base-only), folds in the
 * substitution tables, optionally fingerprints everything it read, and
 * sorts the store.  After that the handle is read-mostly: concurrent
 * lookups share it via &self, with the two permitted mutations (lazy
 * pattern compilation, match counters) synchronized inside the store.
 *
 * Dropping the handle releases everything; mapped specfile regions unmap
 * when their last borrower is gone.
 */

use std::{
    borrow::Cow,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{ensure, Context, Result};
use sha2::{Digest, Sha256};

use crate::{
    binary, compile,
    discover::{open_specfile, with_suffix, FoundFile},
    mmap::MmapArea,
    store::{CmpResult, FileKind, Spec, SpecStore},
    subs::Substitutions,
    text,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
}

/// Sink for diagnostics, supplied by the surrounding library.
pub type LogFn = Box<dyn Fn(LogLevel, &str) + Send + Sync>;
/// Accepts or rejects a context when the handle is validating.
pub type ValidateFn = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;
/// Maps a raw context to its translated form, applied lazily per spec.
pub type TranslateFn = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Default paths and hooks injected by the surrounding library.  The
/// defaults log to stderr, validate nothing and translate nothing.
pub struct Environment {
    pub file_contexts: PathBuf,
    pub subs: PathBuf,
    pub subs_dist: PathBuf,
    pub log: LogFn,
    pub validate: Option<ValidateFn>,
    pub translate: Option<TranslateFn>,
}

impl Default for Environment {
    fn default() -> Environment {
        Environment {
            file_contexts: PathBuf::from("/etc/selinux/contexts/files/file_contexts"),
            subs: PathBuf::from("/etc/selinux/contexts/files/file_contexts.subs"),
            subs_dist: PathBuf::from("/etc/selinux/contexts/files/file_contexts.subs_dist"),
            log: Box::new(|level, msg| eprintln!("fclabel: {level:?}: {msg}")),
            validate: None,
            translate: None,
        }
    }
}

#[derive(Default)]
pub struct Options {
    /// Explicit specfile paths.  When empty, discovery starts from the
    /// environment's default path.
    pub paths: Vec<PathBuf>,
    /// Only load rules whose stem this prefix starts with.
    pub subset: Option<Vec<u8>>,
    /// Skip the `.homedirs` and `.local` auxiliary files.
    pub base_only: bool,
    /// Diagnose duplicates and run the context validation hook; any failure
    /// is fatal for init.
    pub validating: bool,
    /// Fingerprint every consumed specfile.
    pub compute_digest: bool,
    pub env: Environment,
}

pub struct FileContexts {
    store: SpecStore,
    dist_subs: Substitutions,
    subs: Substitutions,
    spec_files: Vec<PathBuf>,
    digest: Option<[u8; 32]>,
    env: Environment,
}

fn load_subs_file(
    table: &mut Substitutions,
    path: &Path,
    digest: &mut Option<Sha256>,
) -> Result<()> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    table.parse_into(&contents, &path.display().to_string())?;
    if let Some(sha) = digest {
        sha.update(&contents);
    }
    Ok(())
}

impl FileContexts {
    pub fn open(opts: Options) -> Result<FileContexts> {
        let Options {
            paths,
            subset,
            base_only,
            validating,
            compute_digest,
            env,
        } = opts;
        let subset = subset.as_deref();
        let path_provided = !paths.is_empty();

        let mut digest = compute_digest.then(Sha256::new);
        let mut dist_subs = Substitutions::default();
        let mut subs = Substitutions::default();

        let spec_files = if path_provided {
            paths
        } else {
            vec![env.file_contexts.clone()]
        };

        // Substitution tables come first, in digest order: distribution,
        // then local, per base path.
        if path_provided {
            for path in &spec_files {
                load_subs_file(&mut dist_subs, &with_suffix(path, "subs_dist"), &mut digest)?;
                load_subs_file(&mut subs, &with_suffix(path, "subs"), &mut digest)?;
            }
        } else {
            load_subs_file(&mut dist_subs, &env.subs_dist, &mut digest)?;
            load_subs_file(&mut subs, &env.subs, &mut digest)?;
        }

        let mut fc = FileContexts {
            store: SpecStore::default(),
            dist_subs,
            subs,
            spec_files,
            digest: None,
            env,
        };

        for i in 0..fc.spec_files.len() {
            let path = fc.spec_files[i].clone();
            ensure!(
                fc.process_file(&path, None, subset, validating, &mut digest)?,
                "{}: no such specfile",
                path.display()
            );
            if validating {
                fc.store
                    .check_duplicates(&path.display().to_string(), &fc.env.log)?;
            }
        }

        if !base_only {
            let base = fc.spec_files[0].clone();
            fc.process_file(&base, Some("homedirs"), subset, validating, &mut digest)?;
            fc.process_file(&base, Some("local"), subset, validating, &mut digest)?;
        }

        fc.store.sort();
        fc.digest = digest.map(|sha| sha.finalize().into());
        Ok(fc)
    }

    /// Fallback driver: load the newest candidate for `base[.suffix]`, and
    /// if that fails, the oldest.  `Ok(false)` means no candidate exists.
    fn process_file(
        &mut self,
        base: &Path,
        suffix: Option<&str>,
        subset: Option<&[u8]>,
        validating: bool,
        digest: &mut Option<Sha256>,
    ) -> Result<bool> {
        let mut last_err = None;
        for pass in 0..2 {
            let Some(found) = open_specfile(base, suffix, pass > 0)? else {
                return Ok(false);
            };
            let mark = self.store.mark();
            match self.load_specfile(&found, subset, validating, digest) {
                Ok(()) => return Ok(true),
                Err(err) => {
                    // back the partial load out before the retry pass
                    self.store.rollback(mark);
                    last_err = Some(err);
                }
            }
        }
        // both passes failed; surface the later error
        Err(last_err.expect("two load passes, no error"))
    }

    fn load_specfile(
        &mut self,
        found: &FoundFile,
        subset: Option<&[u8]>,
        validating: bool,
        digest: &mut Option<Sha256>,
    ) -> Result<()> {
        let path = found.path.display().to_string();
        let mut reader = &found.file;

        let mut magic = [0u8; 4];
        let is_compiled = matches!(
            reader.read_exact(&mut magic),
            Ok(()) if u32::from_le_bytes(magic) == binary::MAGIC
        );

        if is_compiled {
            let area = Arc::new(MmapArea::new(&found.file, found.size)?);
            binary::load(&mut self.store, area.clone(), &path, subset, validating, &self.env)?;
            if let Some(sha) = digest {
                sha.update(area.bytes());
            }
        } else {
            // the text format is UTF-8 tolerant: read raw bytes, decode nothing
            let mut contents = vec![];
            reader.seek(SeekFrom::Start(0))?;
            reader
                .read_to_end(&mut contents)
                .with_context(|| format!("reading {path}"))?;
            text::process_text_file(&mut self.store, &contents, &path, subset, validating, &self.env)?;
            if let Some(sha) = digest {
                sha.update(&contents);
            }
        }
        Ok(())
    }

    /// Distribution rewrites first, then local rewrites the result.
    fn substituted<'a>(&self, key: &'a [u8]) -> Cow<'a, [u8]> {
        let mut key = Cow::Borrowed(key);
        if let Some(rewritten) = self.dist_subs.apply(&key) {
            key = Cow::Owned(rewritten);
        }
        if let Some(rewritten) = self.subs.apply(&key) {
            key = Cow::Owned(rewritten);
        }
        key
    }

    fn context_of<'a>(&'a self, spec: &'a Spec) -> &'a [u8] {
        spec.context(self.env.translate.as_deref())
    }

    /// Resolve a path to its context.  Paths are raw bytes, as on disk.
    /// `Ok(None)` means no rule matched, or the winning rule explicitly
    /// assigns no label.
    pub fn lookup(&self, path: &[u8], kind: FileKind) -> Result<Option<&[u8]>> {
        let key = self.substituted(path);
        Ok(self
            .store
            .lookup(&key, kind, false)?
            .map(|spec| self.context_of(spec)))
    }

    /// Like `lookup`, but skips the translation hook.
    pub fn lookup_raw(&self, path: &[u8], kind: FileKind) -> Result<Option<&[u8]>> {
        let key = self.substituted(path);
        Ok(self
            .store
            .lookup(&key, kind, false)?
            .map(|spec| spec.ctx_raw.as_bytes()))
    }

    /// Could some rule match this path or a descendant of it?  Used to
    /// decide whether descending into a directory can still find labeled
    /// entries.  No label is produced.
    pub fn partial_match(&self, path: &[u8]) -> Result<bool> {
        let key = self.substituted(path);
        Ok(self.store.lookup(&key, FileKind::Any, true)?.is_some())
    }

    /// Resolve a path that is known under additional names.  An exact-path
    /// rule on the primary wins outright, then an exact-path rule on an
    /// alias; otherwise the regex hit with the longest literal prefix wins,
    /// primary first, earlier aliases next.
    pub fn lookup_best_match(
        &self,
        path: &[u8],
        aliases: &[&[u8]],
        kind: FileKind,
    ) -> Result<Option<&[u8]>> {
        if aliases.is_empty() {
            return self.lookup(path, kind);
        }

        let key = self.substituted(path);
        let mut best: Option<&Spec> = None;
        if let Some(spec) = self.store.lookup(&key, kind, false)? {
            if !spec.has_meta_chars {
                return Ok(Some(self.context_of(spec)));
            }
            best = Some(spec);
        }

        for alias in aliases {
            let Some(spec) = self.store.lookup(alias, kind, false)? else {
                continue;
            };
            if !spec.has_meta_chars {
                return Ok(Some(self.context_of(spec)));
            }
            if best.map_or(true, |b| spec.prefix_len > b.prefix_len) {
                best = Some(spec);
            }
        }

        Ok(best.map(|spec| self.context_of(spec)))
    }

    /// Structural relation between two loaded databases.
    pub fn compare(&self, other: &FileContexts) -> CmpResult {
        self.store.compare(&other.store, &self.env.log)
    }

    /// Warn about every rule that never matched anything.  Pure: the handle
    /// is not modified.
    pub fn stats(&self) {
        for spec in &self.store.specs {
            if spec.match_count() != 0 {
                continue;
            }
            let msg = match &spec.type_str {
                Some(type_str) => format!(
                    "no matches for ({}, {}, {})",
                    String::from_utf8_lossy(&spec.regex_str),
                    String::from_utf8_lossy(type_str),
                    String::from_utf8_lossy(&spec.ctx_raw)
                ),
                None => format!(
                    "no matches for ({}, {})",
                    String::from_utf8_lossy(&spec.regex_str),
                    String::from_utf8_lossy(&spec.ctx_raw)
                ),
            };
            (self.env.log)(LogLevel::Warning, &msg);
        }
    }

    /// Hex fingerprint of everything init consumed, when requested.
    pub fn digest(&self) -> Option<String> {
        self.digest.map(hex::encode)
    }

    pub fn spec_files(&self) -> &[PathBuf] {
        &self.spec_files
    }

    /// Serialize the loaded database in its precompiled binary form.
    pub fn write_compiled(&self, out: &mut impl Write) -> Result<()> {
        compile::write_compiled(&self.store, out)
    }
}
