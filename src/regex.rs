/* Adapter around the regex engine used for pattern matching.
 *
 * Patterns are compiled into fully-built dense DFAs, anchored at both ends:
 * a pattern matches only if it consumes the entire subject.  That shape buys
 * us three things the labeling core needs:
 *
 *  - matching is a plain state walk with no allocation and no cache, so
 *    concurrent lookups can share compiled patterns freely,
 *
 *  - a subject that leaves the walk in a live non-matching state is a proper
 *    prefix of something the pattern could still match, which is exactly the
 *    partial-match probe used to decide directory descent,
 *
 *  - dense DFAs have a defined wire form, which is what the precompiled
 *    binary specfile format embeds.
 *
 * Note: we are not 100% compatible with PCRE here, so it's theoretically
 * possible that someone could write a policy that we can't properly handle...
 */

use anyhow::{Context, Result};
use regex_automata::{
    dfa::{dense, Automaton, StartKind},
    util::syntax,
    Anchored, Input,
};

/// Recorded in binary specfile headers; a precompiled file is only usable
/// when the engine that wrote it speaks the same wire format.
pub const VERSION_TAG: &str = "regex-automata-dfa-0.4";

/// The wire form of a dense DFA depends on byte order and nothing else.
pub fn arch_tag() -> &'static str {
    if cfg!(target_endian = "little") {
        "little-endian"
    } else {
        "big-endian"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Match,
    NoMatch,
    /// The subject is a proper prefix of some string the pattern accepts.
    Partial,
}

pub struct Pattern {
    dfa: dense::DFA<Vec<u32>>,
}

impl Pattern {
    /// Subjects are raw bytes, and so are patterns.  The pattern grammar
    /// itself is textual, so non-ASCII pattern bytes are rewritten as \xHH
    /// escapes, which in byte-oriented mode match exactly those bytes.
    pub fn compile(pattern: &[u8]) -> Result<Pattern> {
        let mut text = String::with_capacity(pattern.len());
        for &b in pattern {
            if b.is_ascii() {
                text.push(b as char);
            } else {
                text.push_str(&format!("\\x{b:02X}"));
            }
        }
        let dfa = dense::Builder::new()
            .syntax(syntax::Config::new().unicode(false).utf8(false))
            // minimize so that states with no path to a match collapse into
            // the dead state, keeping the partial-match walk honest
            .configure(
                dense::Config::new()
                    .start_kind(StartKind::Anchored)
                    .minimize(true),
            )
            .build(&text)
            .with_context(|| {
                format!("compiling pattern {}", String::from_utf8_lossy(pattern))
            })?;
        Ok(Pattern { dfa })
    }

    /// Anchored match of the entire subject.  `allow_partial` enables the
    /// directory-descent probe: report when the subject could still be
    /// extended into a full match.
    pub fn matches(&self, subject: &[u8], allow_partial: bool) -> Result<MatchOutcome> {
        let input = Input::new(subject).anchored(Anchored::Yes);
        let mut sid = self
            .dfa
            .start_state_forward(&input)
            .context("pattern match failed")?;

        for &byte in subject {
            sid = self.dfa.next_state(sid, byte);
            if self.dfa.is_dead_state(sid) {
                return Ok(MatchOutcome::NoMatch);
            }
        }

        if self.dfa.is_match_state(self.dfa.next_eoi_state(sid)) {
            Ok(MatchOutcome::Match)
        } else if allow_partial && !self.dfa.is_quit_state(sid) {
            Ok(MatchOutcome::Partial)
        } else {
            Ok(MatchOutcome::NoMatch)
        }
    }

    /// The wire form embedded in precompiled specfiles.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (bytes, padding) = self.dfa.to_bytes_native_endian();
        // the padding prefix only matters for in-place deserialization,
        // which the unaligned on-disk layout can't offer anyway
        bytes[padding..].to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Pattern> {
        // The deserializer insists on u32 alignment and the on-disk layout
        // has none, so land the bytes in u32-backed storage first.
        let mut aligned: Vec<u32> = vec![0; data.len().div_ceil(4)];
        // SAFETY: the destination allocation is at least data.len() bytes
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                aligned.as_mut_ptr().cast::<u8>(),
                data.len(),
            );
        }
        // SAFETY: reading back the same initialized prefix
        let buf = unsafe { std::slice::from_raw_parts(aligned.as_ptr().cast::<u8>(), data.len()) };
        let (dfa, _) = dense::DFA::from_bytes(buf).context("deserializing compiled pattern")?;
        Ok(Pattern {
            dfa: dfa.to_owned(),
        })
    }

    /// Structural comparison of the compiled form.
    pub fn same_as(&self, other: &Pattern) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}
