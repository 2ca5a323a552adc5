use std::fmt;
use std::io::{Read, Write};

use bytes::Bytes;

use super::decode::SizeCheck;
use super::io::Buffered;
use crate::error::{Error, Parse};

/// Hard cap on distinct header fields per request.
pub(crate) const MAX_HEADERS: usize = 100;

/// Header names whose repeated occurrences fold into one value joined
/// with `", "` (RFC 7230 §3.2.2). Stored in canonical title-case so a
/// canonicalized name can be matched with a plain comparison.
static COMMA_SEPARATED_HEADERS: &[&[u8]] = &[
    b"Accept",
    b"Accept-Charset",
    b"Accept-Encoding",
    b"Accept-Language",
    b"Accept-Ranges",
    b"Allow",
    b"Cache-Control",
    b"Connection",
    b"Content-Encoding",
    b"Content-Language",
    b"Expect",
    b"If-Match",
    b"If-None-Match",
    b"Pragma",
    b"Proxy-Authenticate",
    b"Te",
    b"Trailer",
    b"Transfer-Encoding",
    b"Upgrade",
    b"Vary",
    b"Via",
    b"Warning",
    b"Www-Authenticate",
];

/// Inbound request headers.
///
/// An ordered vector of (title-cased name, value) pairs; lookup is
/// case-insensitive. The parser folds repeats of the comma-separated set
/// and overwrites repeats of everything else, so at most one entry exists
/// per name.
#[derive(Default)]
pub struct Headers {
    entries: Vec<(Bytes, Bytes)>,
}

impl Headers {
    pub(crate) fn new() -> Headers {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Case-insensitive lookup of a header value.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.position(name.as_bytes())
            .map(|i| self.entries[i].1.as_ref())
    }

    /// Iterates over `(name, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    /// The number of distinct header fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no header fields were received.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.iter() {
            map.entry(
                &String::from_utf8_lossy(k),
                &String::from_utf8_lossy(v),
            );
        }
        map.finish()
    }
}

/// Reads a CRLF-terminated header block off the wire into `hdrs`.
///
/// An immediate EOF is an illegal end of headers; a bare CRLF line ends
/// the block; every other line must end in CRLF. A line starting with SP
/// or HTAB continues the previous header's value (obs-fold).
pub(crate) fn read_headers<T: Read + Write>(
    io: &mut Buffered<T>,
    guard: &mut SizeCheck,
    hdrs: &mut Headers,
) -> crate::Result<()> {
    loop {
        let line = guard.read_line(io, None)?;
        if line.is_empty() {
            return Err(Error::new_parse(Parse::HeaderEnd));
        }
        if line.as_ref() == b"\r\n" {
            return Ok(());
        }
        if !line.ends_with(b"\r\n") {
            return Err(Error::new_parse(Parse::Line));
        }
        let line = &line[..line.len() - 2];

        if matches!(line.first(), Some(&b' ') | Some(&b'\t')) {
            // obs-fold: the folded value belongs to the previous field
            let folded = trim(line);
            let (_, value) = hdrs
                .entries
                .last_mut()
                .ok_or_else(|| Error::new_parse(Parse::Header))?;
            if !folded.is_empty() {
                let mut joined = Vec::with_capacity(value.len() + 1 + folded.len());
                joined.extend_from_slice(value);
                joined.push(b' ');
                joined.extend_from_slice(folded);
                *value = joined.into();
            }
            continue;
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| Error::new_parse(Parse::Header))?;
        let name = trim(&line[..colon]);
        if name.is_empty() {
            return Err(Error::new_parse(Parse::Header));
        }
        let name = title_case(name);
        let value = Bytes::copy_from_slice(trim(&line[colon + 1..]));

        match hdrs.position(&name) {
            Some(i) if COMMA_SEPARATED_HEADERS.contains(&name.as_ref()) => {
                let existing = &hdrs.entries[i].1;
                let mut joined = Vec::with_capacity(existing.len() + 2 + value.len());
                joined.extend_from_slice(existing);
                joined.extend_from_slice(b", ");
                joined.extend_from_slice(&value);
                hdrs.entries[i].1 = joined.into();
            }
            Some(i) => {
                hdrs.entries[i].1 = value;
            }
            None => {
                if hdrs.entries.len() >= MAX_HEADERS {
                    return Err(Error::new_parse(Parse::TooManyHeaders));
                }
                hdrs.entries.push((name, value));
            }
        }
    }
}

fn trim(mut b: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = b.split_first() {
        if first.is_ascii_whitespace() {
            b = rest;
        } else {
            break;
        }
    }
    while let Some((&last, rest)) = b.split_last() {
        if last.is_ascii_whitespace() {
            b = rest;
        } else {
            break;
        }
    }
    b
}

/// Canonicalizes a header name: uppercase at the start of each `-`
/// delimited segment, lowercase elsewhere.
fn title_case(src: &[u8]) -> Bytes {
    let mut dst = Vec::with_capacity(src.len());
    let mut segment_start = true;
    for &b in src {
        if segment_start {
            dst.push(b.to_ascii_uppercase());
        } else {
            dst.push(b.to_ascii_lowercase());
        }
        segment_start = !b.is_ascii_alphanumeric();
    }
    dst.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::Duplex;

    fn parse(raw: &[u8]) -> crate::Result<Headers> {
        let mut io = Buffered::new(Duplex::new(raw));
        let mut guard = SizeCheck::new(0);
        let mut hdrs = Headers::new();
        read_headers(&mut io, &mut guard, &mut hdrs)?;
        Ok(hdrs)
    }

    #[test]
    fn names_are_title_cased_and_lookup_is_case_insensitive() {
        let hdrs = parse(b"CONTENT-length: 42\r\nx-CUSTOM-thing: yes\r\n\r\n").unwrap();
        assert_eq!(hdrs.get("content-length"), Some(&b"42"[..]));
        assert_eq!(hdrs.get("Content-Length"), Some(&b"42"[..]));
        let names: Vec<_> = hdrs.iter().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(names[0], b"Content-Length");
        assert_eq!(names[1], b"X-Custom-Thing");
    }

    #[test]
    fn comma_separated_repeats_fold() {
        let hdrs = parse(b"Accept: text/html\r\nAccept: application/json\r\n\r\n").unwrap();
        assert_eq!(hdrs.get("accept"), Some(&b"text/html, application/json"[..]));
        assert_eq!(hdrs.len(), 1);
    }

    #[test]
    fn te_and_www_authenticate_fold_despite_odd_casing() {
        let hdrs = parse(b"TE: trailers\r\nTE: deflate\r\n\r\n").unwrap();
        assert_eq!(hdrs.get("te"), Some(&b"trailers, deflate"[..]));
        let hdrs = parse(b"WWW-Authenticate: Basic\r\nWWW-Authenticate: Bearer\r\n\r\n").unwrap();
        assert_eq!(hdrs.get("www-authenticate"), Some(&b"Basic, Bearer"[..]));
    }

    #[test]
    fn non_foldable_repeats_overwrite() {
        let hdrs = parse(b"Host: first\r\nHost: second\r\n\r\n").unwrap();
        assert_eq!(hdrs.get("host"), Some(&b"second"[..]));
        assert_eq!(hdrs.len(), 1);
    }

    #[test]
    fn continuation_lines_extend_the_previous_value() {
        let hdrs = parse(b"X-Long: part one\r\n\tpart two\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(hdrs.get("x-long"), Some(&b"part one part two"[..]));
        assert_eq!(hdrs.get("host"), Some(&b"h"[..]));
    }

    #[test]
    fn continuation_before_any_header_is_illegal() {
        assert!(parse(b" leading fold\r\n\r\n").unwrap_err().is_parse());
    }

    #[test]
    fn missing_colon_is_illegal() {
        assert!(parse(b"not a header\r\n\r\n").unwrap_err().is_parse());
    }

    #[test]
    fn eof_inside_block_is_illegal() {
        assert!(parse(b"Host: h\r\n").unwrap_err().is_parse());
    }

    #[test]
    fn lines_require_crlf() {
        assert!(parse(b"Host: h\nX: y\r\n\r\n").unwrap_err().is_parse());
    }

    #[test]
    fn header_count_is_capped() {
        let mut raw = Vec::new();
        for i in 0..=MAX_HEADERS {
            raw.extend_from_slice(format!("X-Filler-{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        assert!(parse(&raw).unwrap_err().is_parse());
    }

    #[test]
    fn reemission_round_trips_values() {
        let hdrs = parse(b"B-Second: two\r\nA-First: one\r\nAccept: x\r\nAccept: y\r\n\r\n").unwrap();
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = hdrs
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        entries.sort();
        let mut wire = Vec::new();
        for (k, v) in &entries {
            wire.extend_from_slice(k);
            wire.extend_from_slice(b": ");
            wire.extend_from_slice(v);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"\r\n");
        let reparsed = parse(&wire).unwrap();
        for (k, v) in &entries {
            assert_eq!(
                reparsed.get(std::str::from_utf8(k).unwrap()),
                Some(v.as_slice())
            );
        }
    }
}
