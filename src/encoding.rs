use crate::linewrap::{Base64Writer, LineWrapWriter};
use crate::quotedprintable;
use crate::{MimeError, Result};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

/// Define our own because data_encoding::BASE64_MIME, despite its name,
/// is not RFC2045 compliant, and will not ignore spaces
pub(crate) const BASE64_RFC2045: data_encoding::Encoding = data_encoding_macro::new_encoding! {
    symbols: "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/",
    padding: '=',
    ignore: " \r\n\t",
    wrap_width: 76,
    wrap_separator: "\r\n",
};

/// A content-transfer-encoding implementation that can be registered
/// at runtime under an encoding name, overriding the built-ins
pub trait TransferCodec: Send + Sync {
    /// Best-effort decode: always yields usable bytes, with any
    /// problem reported alongside
    fn decode(&self, input: &[u8]) -> (Vec<u8>, Option<MimeError>);
    fn encode(&self, input: &[u8]) -> Vec<u8>;
}

/// Strip the decorations that turn up around encoding names in real
/// mail before matching them
pub fn normalize_encoding(name: &str) -> String {
    let name = name.to_ascii_lowercase();
    let name = name.trim();
    // Some encodings have a trailing dot
    let name = name.trim_matches('.');
    // Some have quotes around them
    let name = name.trim_matches('\'').trim_matches('"');
    // Some carry a charset= prefix
    let name = name.strip_prefix("charset=").unwrap_or(name);
    name.to_string()
}

fn is_identity(name: &str) -> bool {
    matches!(
        name,
        "" | "7bit"
            | "7-bit"
            | "8bit"
            | "8-bit"
            | "binary"
            | "ascii"
            | "us-ascii"
            | "utf8"
            | "utf-8"
            | "ansi_x3.4-1968"
            | "text/plain"
            | "text/html"
    )
}

/// Maps content-transfer-encoding names onto codecs
#[derive(Clone, Default)]
pub struct EncodingRegistry {
    custom: HashMap<String, Arc<dyn TransferCodec>>,
}

impl std::fmt::Debug for EncodingRegistry {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("EncodingRegistry")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EncodingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `codec` under `name`; a later registration replaces
    /// an earlier one and shadows the built-in of the same name
    pub fn register(&mut self, name: &str, codec: Arc<dyn TransferCodec>) {
        self.custom.insert(normalize_encoding(name), codec);
    }

    /// Look up a registered codec by its already-normalized name
    pub(crate) fn custom(&self, norm: &str) -> Option<Arc<dyn TransferCodec>> {
        self.custom.get(norm).cloned()
    }

    /// Decode `input` from the named transfer encoding. An unknown
    /// name or a malformed payload falls back to the untouched input
    /// bytes so the caller always has something to read; the problem
    /// is reported alongside.
    pub fn decode(&self, name: &str, input: &[u8]) -> (Vec<u8>, Option<MimeError>) {
        let norm = normalize_encoding(name);
        if let Some(codec) = self.custom.get(&norm) {
            return codec.decode(input);
        }
        match norm.as_str() {
            "quoted-printable" => quotedprintable::decode(input),
            "base64" => match BASE64_RFC2045.decode(input) {
                Ok(bytes) => (bytes, None),
                Err(err) => {
                    tracing::debug!("base64 body did not decode: {err}");
                    (
                        input.to_vec(),
                        Some(MimeError::Base64(format!("at offset {}", err.position))),
                    )
                }
            },
            n if is_identity(n) => (input.to_vec(), None),
            _ => (
                input.to_vec(),
                Some(MimeError::UnknownEncoding(name.to_string())),
            ),
        }
    }

    /// Encode `input` with the named transfer encoding. Unlike
    /// decoding there is no sensible fallback for a name we cannot
    /// produce, so an unknown one fails.
    pub fn encode(&self, name: &str, input: &[u8]) -> Result<Vec<u8>> {
        let norm = normalize_encoding(name);
        if let Some(codec) = self.custom.get(&norm) {
            return Ok(codec.encode(input));
        }
        match norm.as_str() {
            "quoted-printable" => Ok(quotedprintable::encode(input)),
            "base64" => {
                let mut w = Base64Writer::new(LineWrapWriter::new(Vec::new(), 76));
                w.write_all(input)?;
                let mut out = w.finish()?.into_inner();
                if !out.is_empty() && !out.ends_with(b"\r\n") {
                    out.extend_from_slice(b"\r\n");
                }
                Ok(out)
            }
            n if is_identity(n) => Ok(input.to_vec()),
            _ => Err(MimeError::UnknownEncoding(name.to_string())),
        }
    }

    pub fn is_known(&self, name: &str) -> bool {
        let norm = normalize_encoding(name);
        self.custom.contains_key(&norm)
            || is_identity(&norm)
            || matches!(norm.as_str(), "quoted-printable" | "base64")
    }
}
