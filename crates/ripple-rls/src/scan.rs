//! Lexical scanning shared by the keyword classifier, the fallback table
//! extractor and the WHERE splicer.

use regex::{Match, Regex};

/// Statement text with literals and comments blanked out.
///
/// `masked` has the same byte length as the source, so offsets found in it
/// index the original text directly. `depth` holds the parenthesis depth at
/// every byte.
pub(crate) struct Scan {
    masked: String,
    depth: Vec<u32>,
}

impl Scan {
    pub(crate) fn new(sql: &str) -> Self {
        let masked = mask(sql);
        let mut depth = Vec::with_capacity(masked.len());
        let mut level: u32 = 0;
        for b in masked.bytes() {
            match b {
                b'(' => {
                    depth.push(level);
                    level += 1;
                }
                b')' => {
                    level = level.saturating_sub(1);
                    depth.push(level);
                }
                _ => depth.push(level),
            }
        }
        Self { masked, depth }
    }

    /// Uppercased masked text.
    pub(crate) fn text(&self) -> &str {
        &self.masked
    }

    pub(crate) fn depth_at(&self, offset: usize) -> u32 {
        self.depth.get(offset).copied().unwrap_or(0)
    }

    /// First match of `re` at parenthesis depth zero starting at or after `from`.
    pub(crate) fn find_top_level<'s>(&'s self, re: &Regex, from: usize) -> Option<Match<'s>> {
        if from > self.masked.len() {
            return None;
        }
        re.find_iter(&self.masked)
            .filter(|m| m.start() >= from)
            .find(|m| self.depth_at(m.start()) == 0)
    }
}

/// Replace the contents of string literals, quoted identifiers and comments
/// with spaces, then uppercase. Byte offsets are preserved.
fn mask(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                out.push(quote);
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // A doubled quote stays inside the literal.
                        if bytes.get(i + 1) == Some(&quote) {
                            out.extend_from_slice(b"  ");
                            i += 2;
                            continue;
                        }
                        out.push(quote);
                        i += 1;
                        break;
                    }
                    out.push(b' ');
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out.push(b' ');
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                out.extend_from_slice(b"  ");
                i += 2;
                while i < bytes.len() {
                    if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                        out.extend_from_slice(b"  ");
                        i += 2;
                        break;
                    }
                    out.push(b' ');
                    i += 1;
                }
            }
            b if b.is_ascii() => {
                out.push(b.to_ascii_uppercase());
                i += 1;
            }
            _ => {
                // Non-ASCII outside literals cannot be a keyword.
                out.push(b' ');
                i += 1;
            }
        }
    }

    // Every non-ASCII byte was replaced, so the buffer is ASCII.
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals_and_comments_masked() {
        let scan = Scan::new("select 'it''s where' -- where\nfrom t /* where */");
        assert_eq!(scan.text().len(), "select 'it''s where' -- where\nfrom t /* where */".len());
        assert!(!scan.text().contains("WHERE"));
        assert!(scan.text().starts_with("SELECT '"));
        assert!(scan.text().contains("FROM T"));
    }

    #[test]
    fn test_top_level_search_skips_parentheses() {
        let sql = "SELECT * FROM (SELECT * FROM t WHERE a = 1) x WHERE b = 2";
        let scan = Scan::new(sql);
        let re = Regex::new(r"\bWHERE\b").unwrap();
        let m = scan.find_top_level(&re, 0).unwrap();
        assert_eq!(&sql[m.start()..], "WHERE b = 2");
    }

    #[test]
    fn test_non_ascii_literal_keeps_offsets() {
        let sql = "SELECT * FROM t WHERE name = 'héllo' LIMIT 1";
        let scan = Scan::new(sql);
        let re = Regex::new(r"\bLIMIT\b").unwrap();
        let m = scan.find_top_level(&re, 0).unwrap();
        assert_eq!(&sql[m.start()..], "LIMIT 1");
    }
}
