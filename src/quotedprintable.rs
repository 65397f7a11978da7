use crate::MimeError;
use memchr::memchr;
use std::borrow::Cow;

/// Longest physical line fed to the decoder. RFC 2045 says 76, but
/// real mail routinely exceeds that, so lines are preserved verbatim
/// up to this ceiling and only split beyond it.
const MAX_LINE_LEN: usize = 4093;

fn from_hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        // Accept badly encoded bytes
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Split any physical line longer than the ceiling by inserting a
/// synthetic soft break. The insertion point backs off one or two
/// bytes when it would otherwise land inside an =XX escape, which
/// must stay on a single line.
pub fn split_long_lines(input: &[u8]) -> Cow<[u8]> {
    if !input
        .split(|&b| b == b'\n')
        .any(|line| line.len() > MAX_LINE_LEN)
    {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len() + input.len() / MAX_LINE_LEN * 3);
    let mut rest = input;
    while !rest.is_empty() {
        let line_end = memchr(b'\n', rest).map(|i| i + 1).unwrap_or(rest.len());
        let mut line = &rest[..line_end];
        rest = &rest[line_end..];

        while line.len() > MAX_LINE_LEN {
            let mut cut = MAX_LINE_LEN;
            if line[cut - 1] == b'=' {
                cut -= 1;
            } else if line[cut - 2] == b'=' {
                cut -= 2;
            }
            out.extend_from_slice(&line[..cut]);
            out.extend_from_slice(b"=\r\n");
            line = &line[cut..];
        }
        out.extend_from_slice(line);
    }
    Cow::Owned(out)
}

/// Decode a quoted-printable body, tolerating the malformations seen
/// in real mail: lone LF line endings, a trailing bare `=`, and
/// over-long lines. An invalid escape or an unescaped NUL stops the
/// decode; the bytes decoded so far are returned alongside the error.
pub fn decode(input: &[u8]) -> (Vec<u8>, Option<MimeError>) {
    let input = split_long_lines(input);
    let mut out = Vec::with_capacity(input.len());

    let mut rest: &[u8] = &input;
    while !rest.is_empty() {
        let line_end = memchr(b'\n', rest).map(|i| i + 1).unwrap_or(rest.len());
        let raw_line = &rest[..line_end];
        rest = &rest[line_end..];

        let (content, eol): (&[u8], &[u8]) = match raw_line {
            l if l.ends_with(b"\r\n") => (&l[..l.len() - 2], &l[l.len() - 2..]),
            l if l.ends_with(b"\n") => (&l[..l.len() - 1], &l[l.len() - 1..]),
            l => (l, b""),
        };

        // Transport padding: whitespace before the line break is not
        // part of the data
        let mut content = match content.iter().rposition(|&b| b != b' ' && b != b'\t') {
            Some(p) => &content[..=p],
            None => b"",
        };

        // A soft break consumes both the `=` and the line ending. A
        // bare `=` at the very end of the input is an incomplete soft
        // break, treated the same way.
        let soft_break = content.ends_with(b"=");
        if soft_break {
            content = &content[..content.len() - 1];
        }

        let mut i = 0;
        while i < content.len() {
            match content[i] {
                b'=' => {
                    let hi = content.get(i + 1).copied().and_then(from_hex);
                    let lo = content.get(i + 2).copied().and_then(from_hex);
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => {
                            out.push(hi << 4 | lo);
                            i += 3;
                        }
                        _ => {
                            let seen = &content[i..content.len().min(i + 3)];
                            return (
                                out,
                                Some(MimeError::QuotedPrintable(format!(
                                    "invalid escape {:?}",
                                    String::from_utf8_lossy(seen)
                                ))),
                            );
                        }
                    }
                }
                0 => {
                    return (
                        out,
                        Some(MimeError::QuotedPrintable(
                            "unescaped NUL byte in body".to_string(),
                        )),
                    );
                }
                b => {
                    out.push(b);
                    i += 1;
                }
            }
        }

        if !soft_break {
            out.extend_from_slice(eol);
        }
    }

    (out, None)
}

/// Standard quoted-printable encoding, wrapped at 76 columns
pub fn encode(input: &[u8]) -> Vec<u8> {
    quoted_printable::encode(input)
}
