use crate::headerstore::{HeaderField, HeaderStore};
use crate::{MimeError, Result};
use memchr::memchr;
use regex::bytes::Regex;
use std::sync::LazyLock;

/// Maximum length of a physical header line produced by the folder
const MAX_LINE_LEN: usize = 76;

/// Holds the result of parsing a block of headers
#[derive(Debug)]
pub struct HeaderParseResult {
    pub store: HeaderStore,
    /// Index of the first body byte (just past the blank separator line)
    pub body_offset: usize,
}

fn is_space(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn line_content(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&b| !is_space(b)).unwrap_or(s.len());
    let end = s.iter().rposition(|&b| !is_space(b)).map_or(start, |p| p + 1);
    &s[start..end]
}

/// Strip newlines and the whitespace around them, joining the physical
/// lines of a folded field value with single spaces
fn trim_around_newlines(v: &[u8]) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(v.len());
    let mut rest = v;
    loop {
        let (seg, next) = match memchr(b'\n', rest) {
            Some(i) => (&rest[..i], Some(&rest[i + 1..])),
            None => (rest, None),
        };
        let seg = trim(seg.strip_suffix(b"\r").unwrap_or(seg));
        if !seg.is_empty() {
            if !out.is_empty() {
                out.push(b' ');
            }
            out.extend_from_slice(seg);
        }
        match next {
            Some(n) => rest = n,
            None => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a header block from `input`. The block is a sequence of
/// possibly-continued `Key: value` lines ending at a blank line or at
/// the end of the input. `max_header_bytes` bounds the total block
/// size; any negative value disables the check.
pub fn parse_header(input: &[u8], max_header_bytes: i64) -> Result<HeaderParseResult> {
    let over_budget = |pos: usize| max_header_bytes >= 0 && pos as i64 > max_header_bytes;

    // The first line cannot start with whitespace: there is no prior
    // field for it to continue
    if input.first().copied().map(is_space).unwrap_or(false) {
        return Err(MimeError::HeaderParse(
            "malformed header: initial line is a continuation".to_string(),
        ));
    }

    let mut fields: Vec<HeaderField> = vec![];
    let mut pos = 0;

    while pos < input.len() {
        let line_end = memchr(b'\n', &input[pos..])
            .map(|i| pos + i + 1)
            .unwrap_or(input.len());
        if over_budget(line_end) {
            return Err(MimeError::HeaderTooBig(max_header_bytes));
        }

        if line_content(&input[pos..line_end]).is_empty() {
            // Blank separator line: consume it, the body follows
            pos = line_end;
            break;
        }

        // Gather the field line plus any continuation lines
        let field_start = pos;
        pos = line_end;
        while pos < input.len() && is_space(input[pos]) {
            let cont_end = memchr(b'\n', &input[pos..])
                .map(|i| pos + i + 1)
                .unwrap_or(input.len());
            if over_budget(cont_end) {
                return Err(MimeError::HeaderTooBig(max_header_bytes));
            }
            pos = cont_end;
        }

        let raw = &input[field_start..pos];

        // The key ends at the first colon. Trailing whitespace before
        // the colon appears in the wild, so strip it.
        let colon = memchr(b':', raw).ok_or_else(|| {
            MimeError::HeaderParse(format!(
                "malformed header line: {:?}",
                String::from_utf8_lossy(line_content(&input[field_start..line_end]))
            ))
        })?;
        let key = String::from_utf8_lossy(trim(raw[..colon].strip_suffix(b"\r").unwrap_or(&raw[..colon]))).into_owned();

        // Tokens consist of one or more chars; be liberal and skip a
        // field with an empty key rather than failing the whole block
        if key.is_empty() {
            tracing::warn!("skipping header field with empty key");
            continue;
        }

        let value = trim_around_newlines(&raw[colon + 1..]);
        fields.push(HeaderField::with_raw(key, value, raw.to_vec()));
    }

    Ok(HeaderParseResult {
        store: HeaderStore::from_wire_fields(fields),
        body_offset: pos,
    })
}

/// Detects runs of quoted-printable escapes so that folding never
/// splits inside an encoded-word
static QP_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new("(=[0-9A-F]{2})+").unwrap());

fn last_qp_run_start(v: &[u8]) -> Option<usize> {
    QP_RUN.find_iter(v).last().map(|m| m.start())
}

fn last_fold_ws(v: &[u8]) -> Option<usize> {
    v.iter().rposition(|&b| b == b' ' || b == b'\t' || b == b'\n')
}

fn prev_char_boundary(v: &[u8], mut at: usize) -> usize {
    while at > 0 && (v[at] & 0b1100_0000) == 0b1000_0000 {
        at -= 1;
    }
    at
}

/// Format a single header field, folding so that no physical line
/// exceeds 76 octets. Folding prefers the last whitespace before the
/// limit, or the start of a trailing encoded run when that is later,
/// and falls back to a hard break when neither exists. A value that
/// already carries embedded newlines is left folded as-is.
pub fn format_field(key: &str, value: &str) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(key.len() + value.len() + 8);
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(b": ");

    if value.is_empty() {
        out.extend_from_slice(b"\r\n");
        return out;
    }

    let mut v = value.as_bytes();
    let mut first = true;
    while !v.is_empty() {
        let mut maxlen = MAX_LINE_LEN;
        if first {
            // An oversized key still leaves room for at least one
            // value octet per line
            maxlen = maxlen.saturating_sub(key.len() + 2).max(1);
        }

        // We will need to fold before this index
        let fold_before = maxlen + 1;
        let mut fold_at = v.len();

        let folding: &[u8];
        if fold_before > v.len() {
            // The whole remainder fits; terminate it unless the value
            // already ends in a newline
            folding = if v.ends_with(b"\n") { b"" } else { b"\r\n" };
        } else {
            let window = &v[..fold_before];
            let ws = last_fold_ws(window);
            let qp = last_qp_run_start(window);

            fold_at = match (ws, qp) {
                // Fold at the latest encoded run only when no
                // whitespace follows it before the hard limit
                (Some(w), Some(q)) if q > w => q,
                (Some(w), _) => w,
                (None, Some(q)) => q,
                (None, None) => {
                    // No safe break point; hard-break and insert the
                    // missing whitespace below
                    prev_char_boundary(v, fold_before - 2)
                }
            };
            if fold_at == 0 {
                // The whitespace found is the previous fold's leading
                // space; hard-break past it instead
                fold_at = prev_char_boundary(v, fold_before - 1);
            }

            folding = match v[fold_at] {
                b' ' | b'\t' => {
                    if fold_at > 0 && v[fold_at - 1] == b'\n' {
                        b""
                    } else {
                        b"\r\n"
                    }
                }
                // Already folded here, nothing to insert
                b'\n' => b"",
                _ => b"\r\n ",
            };
        }

        out.extend_from_slice(&v[..fold_at]);
        out.extend_from_slice(folding);
        v = &v[fold_at..];
        first = false;
    }

    out
}

/// Write the header block, terminating it with a blank line. A field
/// that still carries its parsed raw bytes is reproduced verbatim;
/// everything else is folded.
pub fn write_header<W: std::io::Write>(store: &HeaderStore, out: &mut W) -> Result<()> {
    for field in store.iter() {
        match field.raw() {
            Some(raw) => out.write_all(raw)?,
            None => out.write_all(&format_field(field.key(), field.value()))?,
        }
    }
    out.write_all(b"\r\n")?;
    Ok(())
}

/// Convenience wrapper returning the formatted block as bytes
pub fn header_to_bytes(store: &HeaderStore) -> Vec<u8> {
    let mut out = vec![];
    write_header(store, &mut out).expect("writing to a Vec cannot fail");
    out
}
