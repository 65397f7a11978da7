use crate::charset::CharsetRegistry;
use crate::rfc2047;
use crate::MimeError;

/// A parsed structured header value: a media type or disposition
/// token followed by `; name=value` parameters, in source order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaParams {
    pub value: String,
    params: Vec<(String, String)>,
}

fn is_tspecial(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
    )
}

fn is_token_char(b: u8) -> bool {
    (0x21..0x7f).contains(&b) && !is_tspecial(b)
}

impl MediaParams {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            params: vec![],
        }
    }

    /// Parse a `value; name=param` header value. Parameter values are
    /// decoded from their 2047 encoded-word form; a value that will
    /// not decode is kept verbatim and the first such failure is
    /// reported alongside. The parser is deliberately lenient:
    /// a malformed parameter is skipped rather than failing the
    /// whole header.
    pub fn parse(input: &str, charsets: &CharsetRegistry) -> (Self, Option<MimeError>) {
        let mut err: Option<MimeError> = None;
        let (value, mut rest) = match input.find(';') {
            Some(i) => (&input[..i], &input[i + 1..]),
            None => (input, ""),
        };
        let mut result = Self::new(value.trim().to_ascii_lowercase().as_str());

        while !rest.is_empty() {
            rest = rest.trim_start_matches([' ', '\t', '\r', '\n', ';']);
            if rest.is_empty() {
                break;
            }
            let Some(eq) = rest.find('=') else {
                // A bare token with no value; ignore it
                tracing::debug!("ignoring parameter without a value: {rest:?}");
                break;
            };
            let name = rest[..eq].trim().to_ascii_lowercase();
            rest = &rest[eq + 1..];

            let raw_value;
            if let Some(quoted) = rest.strip_prefix('"') {
                let mut out = String::new();
                let mut bytes = quoted.char_indices();
                let mut consumed = quoted.len();
                while let Some((i, c)) = bytes.next() {
                    match c {
                        '\\' => {
                            if let Some((_, escaped)) = bytes.next() {
                                out.push(escaped);
                            }
                        }
                        '"' => {
                            consumed = i + 1;
                            break;
                        }
                        c => out.push(c),
                    }
                }
                raw_value = out;
                rest = &quoted[consumed..];
            } else {
                let end = rest.find(';').unwrap_or(rest.len());
                raw_value = rest[..end].trim().to_string();
                rest = &rest[end..];
            }

            if name.is_empty() {
                continue;
            }
            let (decoded, word_err) = rfc2047::decode_header(&raw_value, charsets);
            if err.is_none() {
                err = word_err;
            }
            result.params.push((name, decoded));
        }

        (result, err)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a parameter, replacing an existing one of the same name in
    /// place or appending a new one
    pub fn set(&mut self, name: &str, value: &str) {
        for (n, v) in &mut self.params {
            if n.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.params.push((name.to_ascii_lowercase(), value.to_string()));
    }

    pub fn remove(&mut self, name: &str) {
        self.params.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn is_multipart(&self) -> bool {
        self.value.starts_with("multipart/")
    }

    pub fn is_text(&self) -> bool {
        self.value.starts_with("text/")
    }

    /// Render back to header-value form. Values that are not plain
    /// tokens are quoted; values outside ascii become encoded-words.
    pub fn encode_value(&self) -> String {
        let mut out = self.value.clone();
        for (name, value) in &self.params {
            out.push_str("; ");
            out.push_str(name);
            out.push('=');

            let encoded = rfc2047::encode_header(value);
            if !encoded.is_empty() && encoded.bytes().all(is_token_char) {
                out.push_str(&encoded);
            } else {
                out.push('"');
                for c in encoded.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
        }
        out
    }
}
