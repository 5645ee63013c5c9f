use chrono::{DateTime, TimeZone, Utc};
use globset::{GlobBuilder, GlobMatcher};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{GovernorError, Result};

/// Source of wall-clock time for window and expiry calculations
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;

    /// Seconds since the Unix epoch
    fn unix_now(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }

    /// Current time as a DateTime<Utc>
    fn utc_now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// System clock
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeSource;

impl TimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for TimeSource {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used to drive window arithmetic
/// deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn advance_millis(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance_millis(secs * 1000);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// A Redis `MATCH` pattern compiled for repeated matching.
///
/// Supports `*`, `?`, classes (`[abc]`, `[a-z]`, `[^a]`) and `\` escapes.
/// The pattern is rewritten into `globset` syntax first: runs of `*`
/// collapse into one, `[^..]` becomes `[!..]`, and `{`, `}` and `,` are
/// escaped so brace alternation never applies. An unterminated `[` is
/// literal, as on the server.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    // None for patterns that can never match, like the empty class `[]`
    matcher: Option<GlobMatcher>,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let Some(glob) = translate_pattern(pattern) else {
            return Ok(Self { matcher: None });
        };

        let matcher = GlobBuilder::new(&glob)
            .literal_separator(false)
            .backslash_escape(true)
            .build()
            .map_err(|e| {
                GovernorError::Validation(format!("invalid key pattern {}: {}", pattern, e))
            })?
            .compile_matcher();

        Ok(Self {
            matcher: Some(matcher),
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.matcher.as_ref().is_some_and(|m| m.is_match(key))
    }
}

fn translate_pattern(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut glob = String::with_capacity(pattern.len() + 8);

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                while chars.get(i) == Some(&'*') {
                    i += 1;
                }
                glob.push('*');
                continue;
            }
            '?' => glob.push('?'),
            '\\' if i + 1 < chars.len() => {
                push_literal(&mut glob, chars[i + 1]);
                i += 2;
                continue;
            }
            '[' => match CharClass::parse(&chars, i + 1) {
                Some((class, next)) => {
                    glob.push_str(&class.to_glob()?);
                    i = next;
                    continue;
                }
                None => push_literal(&mut glob, '['),
            },
            c => push_literal(&mut glob, c),
        }
        i += 1;
    }

    Some(glob)
}

fn push_literal(glob: &mut String, c: char) {
    if matches!(
        c,
        '*' | '?' | '[' | ']' | '{' | '}' | ',' | '\\' | '!' | '^' | '-'
    ) {
        glob.push('\\');
    }
    glob.push(c);
}

/// Characters that change meaning depending on where they sit in a class
fn is_class_special(c: char) -> bool {
    matches!(c, ']' | '-' | '!' | '^')
}

struct CharClass {
    negated: bool,
    /// Inclusive ranges; a single character is `(c, c)`
    ranges: Vec<(char, char)>,
}

impl CharClass {
    /// Parse the class body starting just after `[`. Returns `None` when
    /// the class is unterminated.
    fn parse(chars: &[char], start: usize) -> Option<(Self, usize)> {
        let mut i = start;
        let negated = chars.get(i) == Some(&'^');
        if negated {
            i += 1;
        }

        let mut ranges = Vec::new();
        loop {
            match *chars.get(i)? {
                ']' => return Some((Self { negated, ranges }, i + 1)),
                '\\' => {
                    let escaped = *chars.get(i + 1)?;
                    ranges.push((escaped, escaped));
                    i += 2;
                }
                c => {
                    let is_range = chars.get(i + 1) == Some(&'-')
                        && chars.get(i + 2).is_some_and(|&end| end != ']');
                    if is_range {
                        let end = chars[i + 2];
                        ranges.push(if c <= end { (c, end) } else { (end, c) });
                        i += 3;
                    } else {
                        ranges.push((c, c));
                        i += 1;
                    }
                }
            }
        }
    }

    /// Render in globset syntax, `None` when nothing can match.
    ///
    /// globset has no escapes inside a class, so `]` goes first, `-` last
    /// and `!`/`^` never directly after the opening bracket.
    fn to_glob(&self) -> Option<String> {
        if self.ranges.is_empty() {
            return if self.negated {
                Some("?".to_string())
            } else {
                None
            };
        }

        let mut close = false;
        let mut dash = false;
        let mut bangs = String::new();
        let mut body = String::new();
        let mut literal = |c: char, body: &mut String| match c {
            ']' => close = true,
            '-' => dash = true,
            '!' | '^' => {
                if !bangs.contains(c) {
                    bangs.push(c)
                }
            }
            c => body.push(c),
        };

        for &(mut lo, mut hi) in &self.ranges {
            // Peel special endpoints off as literals; all of them are ASCII
            while lo < hi && is_class_special(lo) {
                literal(lo, &mut body);
                lo = char::from(lo as u8 + 1);
            }
            while lo < hi && is_class_special(hi) {
                literal(hi, &mut body);
                hi = char::from(hi as u8 - 1);
            }
            if lo == hi {
                literal(lo, &mut body);
            } else {
                body.push(lo);
                body.push('-');
                body.push(hi);
            }
        }

        if !self.negated && !close && body.is_empty() {
            // Only `!`, `^` or `-` remain; spell them out as alternatives
            let mut alternatives: Vec<String> = bangs.chars().map(|c| format!("\\{}", c)).collect();
            if dash {
                alternatives.push("\\-".to_string());
            }
            return Some(match alternatives.len() {
                1 => alternatives.remove(0),
                _ => format!("{{{}}}", alternatives.join(",")),
            });
        }

        let mut glob = String::from("[");
        if self.negated {
            glob.push('!');
        }
        if close {
            glob.push(']');
        }
        glob.push_str(&body);
        glob.push_str(&bangs);
        if dash {
            glob.push('-');
        }
        glob.push(']');
        Some(glob)
    }
}
