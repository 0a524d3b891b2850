/* Prefix-rewrite tables applied to lookup keys before matching.
 *
 * Each line of a substitution file is `SOURCE REPLACEMENT`.  Paths are raw
 * bytes, never decoded.  The longest source that is a whole-component
 * prefix of the key wins; the character after the matched prefix must be
 * '/' or end-of-path.
 */

use anyhow::{bail, ensure, Result};

use crate::text::fields;

#[derive(Default)]
pub struct Substitutions {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Substitutions {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn parse_into(&mut self, contents: &[u8], path: &str) -> Result<()> {
        for (idx, line) in contents.split(|&b| b == b'\n').enumerate() {
            let lineno = idx + 1;
            let mut parts = fields(line);
            let src = match parts.next() {
                None => continue, // empty line or line with only whitespace
                Some(comment) if comment.first() == Some(&b'#') => continue,
                Some(src) => src,
            };
            let Some(dst) = parts.next() else {
                bail!("{path}:{lineno}: missing replacement path");
            };
            ensure!(parts.next().is_none(), "{path}:{lineno}: trailing data");

            self.entries.push((src.to_vec(), dst.to_vec()));
        }
        Ok(())
    }

    /// Rewrite `key` if some source prefix applies, longest source first.
    pub fn apply(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut best: Option<&(Vec<u8>, Vec<u8>)> = None;
        for entry in &self.entries {
            let (src, _) = entry;
            if !key.starts_with(src) {
                continue;
            }
            // whole components only
            if key.len() > src.len() && key[src.len()] != b'/' {
                continue;
            }
            if best.map_or(true, |(b, _)| src.len() > b.len()) {
                best = Some(entry);
            }
        }
        best.map(|(src, dst)| {
            let mut rewritten = dst.clone();
            rewritten.extend_from_slice(&key[src.len()..]);
            rewritten
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(contents: &[u8]) -> Substitutions {
        let mut subs = Substitutions::default();
        subs.parse_into(contents, "file_contexts.subs").unwrap();
        subs
    }

    #[test]
    fn test_apply_longest_prefix() {
        let subs = table(
            b"# rewrites\n\
              /data          /var\n\
              /data/web      /srv/www\n",
        );
        assert_eq!(subs.apply(b"/data/log"), Some(b"/var/log".to_vec()));
        assert_eq!(subs.apply(b"/data/web/html"), Some(b"/srv/www/html".to_vec()));
        assert_eq!(subs.apply(b"/data"), Some(b"/var".to_vec()));
        assert_eq!(subs.apply(b"/datalog"), None);
        assert_eq!(subs.apply(b"/other"), None);
    }

    #[test]
    fn test_parse_errors() {
        let mut subs = Substitutions::default();
        assert!(subs.parse_into(b"/only-one-field\n", "subs").is_err());
        assert!(subs.parse_into(b"/a /b extra\n", "subs").is_err());
    }
}
