use crate::{MimeError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A character set implementation that can be registered at runtime,
/// replacing or extending the built-in table
pub trait CharsetCodec: Send + Sync {
    fn decode(&self, input: &[u8]) -> Result<String>;
    fn encode(&self, input: &str) -> Result<Vec<u8>>;
}

/// Maps charset labels to codecs. Labels are matched
/// case-insensitively and a handful of aliases seen in real mail are
/// folded onto their canonical names before lookup.
#[derive(Clone, Default)]
pub struct CharsetRegistry {
    custom: HashMap<String, Arc<dyn CharsetCodec>>,
}

impl std::fmt::Debug for CharsetRegistry {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("CharsetRegistry")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fold a charset label onto the name the lookup tables know it by
pub fn normalize_charset(label: &str) -> String {
    let label = label.trim().trim_matches('"');
    let mut name = label.to_ascii_lowercase();
    name = match name.as_str() {
        // Code-page spellings of the windows-* family
        "cp1250" => "windows-1250".to_string(),
        "cp1251" => "windows-1251".to_string(),
        "cp1252" => "windows-1252".to_string(),
        "cp1253" => "windows-1253".to_string(),
        "cp1254" => "windows-1254".to_string(),
        "cp1255" => "windows-1255".to_string(),
        "cp1256" => "windows-1256".to_string(),
        "cp1257" => "windows-1257".to_string(),
        "cp1258" => "windows-1258".to_string(),
        // gb2312 content is in practice gbk
        "gb2312" => "gbk".to_string(),
        "ansi_x3.110-1983" => "iso-8859-1".to_string(),
        _ => name,
    };
    name
}

fn is_identity(name: &str) -> bool {
    matches!(name, "utf-8" | "utf8" | "us-ascii" | "ascii")
        || name.starts_with("ansi_x3.4-")
}

impl CharsetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `codec` under `label`, shadowing any built-in
    /// encoding with the same name
    pub fn register(&mut self, label: &str, codec: Arc<dyn CharsetCodec>) {
        self.custom.insert(normalize_charset(label), codec);
    }

    /// Decode `input` from the named charset into UTF-8 text.
    /// Malformed sequences become replacement characters rather than
    /// errors; only an unknown label fails.
    pub fn decode(&self, label: &str, input: &[u8]) -> Result<String> {
        let name = normalize_charset(label);
        if let Some(codec) = self.custom.get(&name) {
            return codec.decode(input);
        }
        if is_identity(&name) {
            return Ok(String::from_utf8_lossy(input).into_owned());
        }
        let enc = encoding_rs::Encoding::for_label_no_replacement(name.as_bytes())
            .ok_or_else(|| MimeError::UnknownCharset(label.to_string()))?;
        let (decoded, _malformed) = enc.decode_without_bom_handling(input);
        Ok(decoded.into_owned())
    }

    /// Encode UTF-8 `input` into the named charset. Fails when the
    /// label is unknown or the text has no representation in it;
    /// callers fall back to utf-8 in that case.
    pub fn encode(&self, label: &str, input: &str) -> Result<Vec<u8>> {
        let name = normalize_charset(label);
        if let Some(codec) = self.custom.get(&name) {
            return codec.encode(input);
        }
        if is_identity(&name) {
            return Ok(input.as_bytes().to_vec());
        }
        let enc = encoding_rs::Encoding::for_label_no_replacement(name.as_bytes())
            .ok_or_else(|| MimeError::UnknownCharset(label.to_string()))?;
        let (encoded, _, had_unmappable) = enc.encode(input);
        if had_unmappable {
            return Err(MimeError::CharsetEncode(format!(
                "text is not representable in {label}"
            )));
        }
        Ok(encoded.into_owned())
    }

    pub fn is_known(&self, label: &str) -> bool {
        let name = normalize_charset(label);
        self.custom.contains_key(&name)
            || is_identity(&name)
            || encoding_rs::Encoding::for_label_no_replacement(name.as_bytes()).is_some()
    }
}
