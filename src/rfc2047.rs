use crate::charset::CharsetRegistry;
use crate::MimeError;

/// One decoded encoded-word, or the reason it was left alone
struct Word<'a> {
    /// Bytes consumed from the input, including the =? ?= delimiters
    raw_len: usize,
    charset: &'a str,
    encoding: u8,
    payload: &'a str,
}

/// Try to parse an encoded-word at the start of `s`
fn parse_word(s: &str) -> Option<Word> {
    let rest = s.strip_prefix("=?")?;
    let q1 = rest.find('?')?;
    let charset = &rest[..q1];
    // RFC 2231 language suffix on the charset is ignored
    let charset = charset.split('*').next().unwrap_or(charset);
    let rest = &rest[q1 + 1..];

    let mut chars = rest.bytes();
    let encoding = chars.next()?;
    if !matches!(encoding, b'B' | b'b' | b'Q' | b'q') {
        return None;
    }
    let rest = rest.get(1..)?.strip_prefix('?')?;
    let end = rest.find("?=")?;
    let payload = &rest[..end];
    if payload.contains(char::is_whitespace) {
        return None;
    }

    // "=?" charset "?" enc "?" payload "?="
    let raw_len = 2 + q1 + 3 + end + 2;
    Some(Word {
        raw_len,
        charset: if charset.is_empty() { "us-ascii" } else { charset },
        encoding,
        payload,
    })
}

fn decode_word(
    word: &Word,
    charsets: &CharsetRegistry,
) -> std::result::Result<String, MimeError> {
    let bytes = match word.encoding {
        b'B' | b'b' => data_encoding::BASE64_MIME
            .decode(word.payload.as_bytes())
            .map_err(|err| {
                MimeError::Base64(format!("encoded-word payload: {err:#}"))
            })?,
        b'Q' | b'q' => quoted_printable::decode(
            word.payload.replace('_', " "),
            quoted_printable::ParseMode::Robust,
        )
        .map_err(|err| {
            MimeError::QuotedPrintable(format!("encoded-word payload: {err:#}"))
        })?,
        _ => return Err(MimeError::HeaderParse("invalid encoded-word".to_string())),
    };
    charsets.decode(word.charset, &bytes)
}

/// Decode all RFC 2047 encoded-words in a header value. Unencoded
/// text passes through untouched and whitespace separating two
/// adjacent encoded-words is dropped. A word that cannot be decoded
/// stays in the output verbatim; the first such failure is reported
/// alongside the best-effort result.
pub fn decode_header(input: &str, charsets: &CharsetRegistry) -> (String, Option<MimeError>) {
    let mut out = String::with_capacity(input.len());
    let mut err: Option<MimeError> = None;
    let mut rest = input;
    let mut after_word = false;

    while !rest.is_empty() {
        let Some(start) = rest.find("=?") else {
            break;
        };
        let (before, candidate) = rest.split_at(start);

        match parse_word(candidate) {
            Some(word) => match decode_word(&word, charsets) {
                Ok(decoded) => {
                    // Whitespace between two encoded-words is elided
                    if !(after_word && before.chars().all(char::is_whitespace)) {
                        out.push_str(before);
                    }
                    out.push_str(&decoded);
                    after_word = true;
                    rest = &candidate[word.raw_len..];
                }
                Err(word_err) => {
                    tracing::debug!("leaving encoded-word verbatim: {word_err}");
                    if err.is_none() {
                        err = Some(word_err);
                    }
                    out.push_str(before);
                    out.push_str(&candidate[..word.raw_len]);
                    after_word = false;
                    rest = &candidate[word.raw_len..];
                }
            },
            None => {
                // Not a well-formed word; emit through the =? marker
                // and keep scanning
                out.push_str(before);
                out.push_str("=?");
                after_word = false;
                rest = &candidate[2..];
            }
        }
    }
    out.push_str(rest);
    (out, err)
}

const MAX_WORD_LEN: usize = 75;
const HEX_CHARS: &[u8] = b"0123456789ABCDEF";

fn needs_qp(c: u8) -> bool {
    !(c.is_ascii_alphanumeric() || matches!(c, b'!' | b'*' | b'+' | b'-' | b'/'))
}

/// True when a header value can be written as-is, with no 2047
/// encoding required
pub fn is_plain_ascii(value: &str) -> bool {
    value
        .bytes()
        .all(|b| (0x20..0x7f).contains(&b) || b == b'\t')
}

/// Q-encode `text` into one or more UTF-8 encoded-words, folding onto
/// continuation lines as needed so no word exceeds 75 octets. Each
/// char is encoded atomically, keeping multi-byte sequences inside a
/// single word.
pub fn encode_word(text: &str) -> String {
    let prefix = b"=?UTF-8?q?";
    let suffix = b"?=";
    let limit = MAX_WORD_LEN - prefix.len() - suffix.len();

    let mut result = Vec::with_capacity(text.len() + prefix.len() + suffix.len());
    result.extend_from_slice(prefix);
    let mut line_len = 0;

    let mut buf = [0u8; 4];
    for c in text.chars() {
        let bytes = c.encode_utf8(&mut buf).as_bytes();
        let needed: usize = bytes
            .iter()
            .map(|&b| if needs_qp(b) && b != b' ' { 3 } else { 1 })
            .sum();
        if line_len + needed > limit {
            result.extend_from_slice(suffix);
            result.extend_from_slice(b"\r\n\t");
            result.extend_from_slice(prefix);
            line_len = 0;
        }
        for &b in bytes {
            if b == b' ' {
                result.push(b'_');
            } else if needs_qp(b) {
                result.push(b'=');
                result.push(HEX_CHARS[(b >> 4) as usize]);
                result.push(HEX_CHARS[(b & 0x0f) as usize]);
            } else {
                result.push(b);
            }
        }
        line_len += needed;
    }

    result.extend_from_slice(suffix);
    String::from_utf8(result).expect("encoded words are pure ascii")
}

/// Encode `value` for use as a header value, 2047-encoding only when
/// it strays outside printable ascii
pub fn encode_header(value: &str) -> String {
    if is_plain_ascii(value) {
        value.to_string()
    } else {
        encode_word(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(input: &str) -> (String, Option<MimeError>) {
        decode_header(input, &CharsetRegistry::new())
    }

    #[test]
    fn plain_text_untouched() {
        let (out, err) = decode("nothing encoded here");
        k9::assert_equal!(out, "nothing encoded here");
        k9::assert_equal!(err, None);
    }

    #[test]
    fn q_word() {
        let (out, err) = decode("=?UTF-8?q?hello_there?=");
        k9::assert_equal!(out, "hello there");
        k9::assert_equal!(err, None);
    }

    #[test]
    fn b_word_with_charset() {
        // "café" in windows-1252, base64
        let (out, err) = decode("=?windows-1252?B?Y2Fmzg==?=");
        k9::assert_equal!(err, None);
        // 0xCE is Î in 1252
        k9::assert_equal!(out, "cafÎ");

        let (out, err) = decode("=?windows-1252?B?Y2Fm6Q==?=");
        k9::assert_equal!(err, None);
        k9::assert_equal!(out, "café");
    }

    #[test]
    fn adjacent_words_merge() {
        let (out, err) = decode("=?UTF-8?q?one?=   =?UTF-8?q?_two?=");
        k9::assert_equal!(out, "one two");
        k9::assert_equal!(err, None);
    }

    #[test]
    fn word_next_to_plain_text_keeps_space() {
        let (out, _) = decode("hello =?UTF-8?q?world?= again");
        k9::assert_equal!(out, "hello world again");
    }

    #[test]
    fn unknown_charset_keeps_raw_token() {
        let input = "before =?x-weird?q?stuff?= after";
        let (out, err) = decode(input);
        k9::assert_equal!(out, input);
        k9::assert_equal!(err, Some(MimeError::UnknownCharset("x-weird".to_string())));
    }

    #[test]
    fn bad_base64_keeps_raw_token() {
        let input = "=?UTF-8?B?!!notbase64!!?=";
        let (out, err) = decode(input);
        k9::assert_equal!(out, input);
        assert!(matches!(err, Some(MimeError::Base64(_))));
    }

    #[test]
    fn malformed_word_passes_through() {
        let input = "=?UTF-8?q?missing terminator";
        let (out, err) = decode(input);
        k9::assert_equal!(out, input);
        k9::assert_equal!(err, None);
    }

    #[test]
    fn charset_language_suffix() {
        let (out, err) = decode("=?us-ascii*en?q?Hello?=");
        k9::assert_equal!(out, "Hello");
        k9::assert_equal!(err, None);
    }

    #[test]
    fn encode_plain_stays_plain() {
        k9::assert_equal!(encode_header("just ascii"), "just ascii");
    }

    #[test]
    fn encode_roundtrip() {
        let text = "Hello Dog, 🐶 Woof Woof! Have a great day";
        let encoded = encode_header(text);
        assert!(encoded.starts_with("=?UTF-8?q?"));
        let (decoded, err) = decode(&encoded);
        k9::assert_equal!(decoded, text);
        k9::assert_equal!(err, None);
    }

    #[test]
    fn encode_long_text_splits_words() {
        let text = "日本語のテキストがとても長い場合は複数の符号語に分割されます";
        let encoded = encode_word(text);
        for line in encoded.split("\r\n") {
            assert!(line.trim_start().len() <= MAX_WORD_LEN, "too long: {line:?}");
        }
        let (decoded, err) = decode_header(&encoded, &CharsetRegistry::new());
        k9::assert_equal!(decoded, text);
        k9::assert_equal!(err, None);
    }
}
