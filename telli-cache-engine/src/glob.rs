//! # Glob Matching
//!
//! Redis-style key patterns for `SCAN ... MATCH`:
//!
//! - `*` any run of bytes, `?` exactly one byte
//! - `[abc]`, `[a-z]`, `[^a]` byte classes
//! - `\x` matches `x` literally
//!
//! An unterminated `[` is treated as a literal bracket.

/// Returns true when `text` matches the glob `pattern`.
///
/// Iterative with single-star backtracking, so the cost stays
/// O(pattern * text) even for patterns with many stars.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut p = 0;
    let mut t = 0;
    // Resume point after the most recent `*`: (pattern index, text index).
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p + 1, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => match match_class(pattern, p, text[t]) {
                    Some((true, next)) => {
                        p = next;
                        t += 1;
                        continue;
                    }
                    Some((false, _)) => {}
                    None => {
                        if text[t] == b'[' {
                            p += 1;
                            t += 1;
                            continue;
                        }
                    }
                },
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                literal => {
                    if literal == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((star_p, star_t)) => {
                p = star_p;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Matches `ch` against the class opening at `pattern[start] == b'['`.
///
/// Returns `(matched, index after the closing bracket)`, or `None` when the
/// class is unterminated.
fn match_class(pattern: &[u8], start: usize, ch: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < pattern.len() {
        match pattern[i] {
            b']' => return Some((matched != negate, i + 1)),
            b'\\' if i + 1 < pattern.len() => {
                matched |= pattern[i + 1] == ch;
                i += 2;
            }
            lo if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' => {
                let hi = pattern[i + 2];
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                matched |= (lo..=hi).contains(&ch);
                i += 3;
            }
            literal => {
                matched |= literal == ch;
                i += 1;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_prefix_pattern() {
        assert!(glob_match(b"telli:dialog:*", b"telli:dialog:user:42"));
        assert!(glob_match(b"telli:dialog:*", b"telli:dialog:"));
        assert!(!glob_match(b"telli:dialog:*", b"telli:dialogx"));
        assert!(!glob_match(b"telli:dialog:*", b"telli:admin:user:42"));
    }

    #[test]
    fn wildcards_and_backtracking() {
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(!glob_match(b"h?llo", b"hllo"));
        assert!(glob_match(b"*a*b", b"xxaxxab"));
        assert!(!glob_match(b"*a*b", b"xxaxxa"));
    }

    #[test]
    fn byte_classes() {
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[ae]llo", b"hillo"));
        assert!(glob_match(b"h[^e]llo", b"hallo"));
        assert!(!glob_match(b"h[^e]llo", b"hello"));
        assert!(glob_match(b"h[a-c]llo", b"hbllo"));
        assert!(glob_match(b"h[c-a]llo", b"hbllo"));
        assert!(!glob_match(b"h[a-c]llo", b"hdllo"));
    }

    #[test]
    fn escapes_match_literally() {
        assert!(glob_match(b"ns\\*:*", b"ns*:key"));
        assert!(!glob_match(b"ns\\*:*", b"nsX:key"));
        assert!(glob_match(b"a\\?", b"a?"));
        assert!(glob_match(b"[\\]]", b"]"));
    }

    #[test]
    fn unterminated_class_is_literal() {
        assert!(glob_match(b"a[b", b"a[b"));
        assert!(!glob_match(b"a[b", b"ab"));
    }
}
