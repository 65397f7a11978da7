mod charset;
mod encoding;
mod entity;
mod error;
mod header;
mod headerstore;
mod linewrap;
mod multipart;
mod params;
mod quotedprintable;
mod rfc2047;
mod stream;

pub use error::MimeError;
pub type Result<T> = std::result::Result<T, MimeError>;

pub use charset::{normalize_charset, CharsetCodec, CharsetRegistry};
pub use encoding::{normalize_encoding, EncodingRegistry, TransferCodec};
pub use entity::{walk, Body, Codec, Entity, MultipartBody, ReadOptions};
pub use header::{format_field, header_to_bytes, parse_header, write_header, HeaderParseResult};
pub use headerstore::{canonical_key, Fields, FieldsByKey, HeaderField, HeaderStore};
pub use linewrap::{Base64Writer, LineWrapWriter};
pub use multipart::{MultipartReader, MultipartWriter, PartWriter};
pub use params::MediaParams;
pub use quotedprintable::split_long_lines;
pub use rfc2047::{decode_header, encode_header, encode_word};
pub use stream::{BridgeWriter, StreamBridge};
