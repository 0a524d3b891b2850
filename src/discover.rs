/* Specfile discovery: a base path plus an optional semantic suffix names up
 * to two on-disk candidates, the text form and its precompiled `.bin`
 * sibling.  The first load pass opens the newest of the two (mtime ties go
 * to the .bin); if that file fails to load, the retry pass inverts the
 * preference and picks the oldest.
 */

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rustix::fs::{stat, Stat};

pub struct FoundFile {
    pub path: PathBuf,
    pub file: File,
    pub size: u64,
}

pub(crate) fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn candidate(base: &Path, suffix: Option<&str>, bin: bool) -> PathBuf {
    let mut path = match suffix {
        Some(suffix) => with_suffix(base, suffix),
        None => base.to_path_buf(),
    };
    if bin {
        path = with_suffix(&path, "bin");
    }
    path
}

pub fn open_specfile(
    base: &Path,
    suffix: Option<&str>,
    open_oldest: bool,
) -> Result<Option<FoundFile>> {
    let mut found: Option<(PathBuf, Stat)> = None;

    for bin in [false, true] {
        let path = candidate(base, suffix, bin);
        let Ok(sb) = stat(&path) else { continue };

        match &found {
            None => found = Some((path, sb)),
            Some((_, best)) => {
                // Keep picking the newest, where "newest" includes equality
                // so that the .bin candidate wins a timestamp tie.  The
                // retry pass inverts the whole preference.
                if open_oldest != (sb.st_mtime >= best.st_mtime) {
                    found = Some((path, sb));
                }
            }
        }
    }

    let Some((path, sb)) = found else {
        return Ok(None);
    };
    let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Some(FoundFile {
        path,
        file,
        size: sb.st_size as u64,
    }))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    fn touch(path: &Path, contents: &str, age_secs: u64) -> Result<()> {
        std::fs::write(path, contents)?;
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(path)?
            .set_modified(mtime)?;
        Ok(())
    }

    #[test]
    fn test_newest_then_oldest() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let base = dir.path().join("file_contexts");
        touch(&base, "text", 100)?;
        touch(&with_suffix(&base, "bin"), "binary", 10)?;

        let first = open_specfile(&base, None, false)?.unwrap();
        assert_eq!(first.path, with_suffix(&base, "bin"));
        let retry = open_specfile(&base, None, true)?.unwrap();
        assert_eq!(retry.path, base);
        Ok(())
    }

    #[test]
    fn test_tie_prefers_bin() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let base = dir.path().join("file_contexts");
        std::fs::write(&base, "text")?;
        std::fs::write(with_suffix(&base, "bin"), "binary")?;
        let mtime = SystemTime::now();
        for path in [base.clone(), with_suffix(&base, "bin")] {
            File::options().write(true).open(path)?.set_modified(mtime)?;
        }

        let first = open_specfile(&base, None, false)?.unwrap();
        assert_eq!(first.path, with_suffix(&base, "bin"));
        Ok(())
    }

    #[test]
    fn test_suffix_and_missing() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let base = dir.path().join("file_contexts");
        assert!(open_specfile(&base, None, false)?.is_none());

        touch(&with_suffix(&base, "local"), "aux", 0)?;
        let found = open_specfile(&base, Some("local"), false)?.unwrap();
        assert_eq!(found.path, with_suffix(&base, "local"));
        assert_eq!(found.size, 3);
        Ok(())
    }
}
