use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MimeError {
    #[error("invalid header: {0}")]
    HeaderParse(String),
    #[error("header block exceeds the configured limit of {0} bytes")]
    HeaderTooBig(i64),
    #[error("unknown content transfer encoding {0:?}")]
    UnknownEncoding(String),
    #[error("unknown charset {0:?}")]
    UnknownCharset(String),
    #[error("charset {0:?} cannot represent all of the text")]
    CharsetEncode(String),
    #[error("quoted-printable decode: {0}")]
    QuotedPrintable(String),
    #[error("base64 decode: {0}")]
    Base64(String),
    #[error("multipart body is missing its terminal boundary")]
    TruncatedMultipart,
    #[error("entity is not multipart")]
    NotMultipart,
    #[error("cyclic entity tree")]
    CyclicEntity,
    #[error("stream bridge producer failed: {0}")]
    Bridge(String),
    /// IO errors are carried as strings so that MimeError remains
    /// Clone and PartialEq
    #[error("I/O error: {0}")]
    Io(String),
}

impl MimeError {
    /// Whether this error reports that the entity advertised a
    /// content-transfer-encoding that no registered codec handles
    pub fn is_unknown_encoding(&self) -> bool {
        matches!(self, Self::UnknownEncoding(_))
    }

    /// Whether this error reports that the entity advertised a
    /// charset that no registered transcoder handles
    pub fn is_unknown_charset(&self) -> bool {
        matches!(self, Self::UnknownCharset(_))
    }

    /// Classified content errors come with a best-effort fallback
    /// result; everything else aborts the operation that raised it
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownEncoding(_)
                | Self::UnknownCharset(_)
                | Self::CharsetEncode(_)
                | Self::QuotedPrintable(_)
                | Self::Base64(_)
        )
    }
}

impl From<std::io::Error> for MimeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
