use crate::charset::CharsetRegistry;
use crate::encoding::EncodingRegistry;
use crate::header::{parse_header, write_header, HeaderParseResult};
use crate::headerstore::HeaderStore;
use crate::multipart::MultipartReader;
use crate::params::MediaParams;
use crate::stream::StreamBridge;
use crate::{quotedprintable, MimeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;

fn default_max_header_bytes() -> i64 {
    1024 * 1024
}

/// Parsing limits. `max_header_bytes` bounds the total size of one
/// header block; a negative value disables the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: i64,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

/// The codec instance: transfer-encoding and charset registries plus
/// read limits. All parsing and serialization goes through one of
/// these; registering a custom codec affects only this instance.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    pub encodings: EncodingRegistry,
    pub charsets: CharsetRegistry,
    pub options: ReadOptions,
}

/// The body of an entity
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Decoded leaf content
    Data(Vec<u8>),
    /// Materialized children of a multipart entity
    Multipart(MultipartBody),
    /// A multipart body that has not been demuxed yet; its bytes are
    /// held raw and children come from `multipart_reader`
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultipartBody {
    /// `None` when the first boundary opens the body immediately;
    /// `Some` preserves the preamble region, even an empty one, along
    /// with the CRLF that separated it from the first boundary
    pub preamble: Option<Vec<u8>>,
    pub parts: Vec<Entity>,
    pub epilogue: Vec<u8>,
}

/// A header plus a body: one node of a MIME message tree
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    header: HeaderStore,
    /// The transfer-encoded body bytes as they appeared on the wire,
    /// kept so an unmutated entity re-serializes byte-exactly
    raw_body: Option<Vec<u8>>,
    body: Body,
    defect: Option<MimeError>,
}

impl Entity {
    pub fn header(&self) -> &HeaderStore {
        &self.header
    }

    /// Mutable header access. Untouched fields still reproduce their
    /// original bytes on write; changed ones are refolded.
    pub fn header_mut(&mut self) -> &mut HeaderStore {
        &mut self.header
    }

    /// The classified content error recorded while decoding this
    /// entity's body, if any. See [`MimeError::is_recoverable`].
    pub fn defect(&self) -> Option<&MimeError> {
        self.defect.as_ref()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Decoded body bytes; empty for multipart entities
    pub fn body_bytes(&self) -> &[u8] {
        match &self.body {
            Body::Data(data) => data,
            _ => b"",
        }
    }

    /// Decoded body as text
    pub fn text_body(&self) -> String {
        String::from_utf8_lossy(self.body_bytes()).into_owned()
    }

    /// Replace the body, dropping the raw bytes so the entity is
    /// re-encoded on write
    pub fn set_body(&mut self, data: Vec<u8>) {
        self.body = Body::Data(data);
        self.raw_body = None;
        self.defect = None;
    }

    pub fn set_text_body(&mut self, text: &str) {
        self.set_body(text.as_bytes().to_vec());
    }

    /// Materialized children, when this is a multipart entity whose
    /// parts have been built or resolved
    pub fn parts(&self) -> Option<&[Entity]> {
        match &self.body {
            Body::Multipart(mb) => Some(&mb.parts),
            _ => None,
        }
    }

    /// Mutable child access. Treated as a mutation: the raw body is
    /// dropped and the multipart structure is re-serialized on write.
    pub fn parts_mut(&mut self) -> Option<&mut Vec<Entity>> {
        match &mut self.body {
            Body::Multipart(mb) => {
                self.raw_body = None;
                Some(&mut mb.parts)
            }
            _ => None,
        }
    }

    /// Mutable body access, also treated as a mutation
    pub fn body_mut(&mut self) -> &mut Body {
        self.raw_body = None;
        &mut self.body
    }

    /// The descendant at the given sequence of zero-based child
    /// indices; `&[]` is the entity itself. `None` when the path
    /// leads through a leaf or an out-of-range index.
    pub fn at_path(&self, path: &[usize]) -> Option<&Entity> {
        let mut node = self;
        for &idx in path {
            node = node.parts()?.get(idx)?;
        }
        Some(node)
    }

    fn content_type(&self, charsets: &CharsetRegistry) -> Option<MediaParams> {
        self.header
            .get("Content-Type")
            .map(|v| MediaParams::parse(v, charsets).0)
    }

    /// Build a plain-text leaf. The transfer encoding is chosen by
    /// size: none when the text is already transport-safe, otherwise
    /// quoted-printable unless base64 would be smaller.
    pub fn text(content_type: &str, content: &str) -> Entity {
        let qp = quotedprintable::encode(content.as_bytes());

        let mut ct = MediaParams::new(content_type);
        let mut header = HeaderStore::new();
        let cte = if qp == content.as_bytes() {
            None
        } else {
            ct.set("charset", "utf-8");
            if qp.len() <= crate::encoding::BASE64_RFC2045.encode_len(content.len()) {
                Some("quoted-printable")
            } else {
                Some("base64")
            }
        };
        if let Some(cte) = cte {
            header.add("Content-Transfer-Encoding", cte);
        }
        header.add("Content-Type", &ct.encode_value());

        Entity {
            header,
            raw_body: None,
            body: Body::Data(content.as_bytes().to_vec()),
            defect: None,
        }
    }

    /// Demux this entity's parts. Works on a parsed multipart body
    /// (including one whose children were already materialized, which
    /// yields clones) and fails with `NotMultipart` otherwise.
    pub fn multipart_reader<'a>(&'a self, codec: &'a Codec) -> Result<MultipartReader<'a>> {
        let Some(ct) = self.content_type(&codec.charsets) else {
            return Err(MimeError::NotMultipart);
        };
        if !ct.is_multipart() {
            return Err(MimeError::NotMultipart);
        }

        if let Some(raw) = self.raw_body.as_deref() {
            // A multipart type without a boundary is an opaque leaf,
            // not a demuxable multipart
            let Some(boundary) = ct.get("boundary") else {
                return Err(MimeError::NotMultipart);
            };
            return Ok(MultipartReader::new(codec, boundary, raw));
        }
        match &self.body {
            Body::Multipart(mb) => Ok(MultipartReader::over_parts(codec, mb.parts.clone())),
            _ => Err(MimeError::NotMultipart),
        }
    }

    /// Resolve deferred multipart bodies into materialized children,
    /// recursively. The raw bytes are kept, so an unmutated entity
    /// still round-trips exactly.
    pub fn materialize(&mut self, codec: &Codec) -> Result<()> {
        match &mut self.body {
            Body::Data(_) => return Ok(()),
            Body::Multipart(mb) => {
                for part in &mut mb.parts {
                    part.materialize(codec)?;
                }
                return Ok(());
            }
            Body::Deferred => {}
        }

        let Some(ct) = self.content_type(&codec.charsets) else {
            return Ok(());
        };
        let Some(boundary) = ct.get("boundary") else {
            // Tolerated: a multipart type with no boundary stays an
            // opaque leaf
            return Ok(());
        };

        let mut resolved = {
            let Some(raw) = self.raw_body.as_deref() else {
                self.body = Body::Multipart(MultipartBody::default());
                return Ok(());
            };
            let mut rd = MultipartReader::new(codec, boundary, raw);
            let mut parts = vec![];
            while let Some(part) = rd.next() {
                parts.push(part?);
            }
            MultipartBody {
                preamble: rd.preamble().map(<[u8]>::to_vec),
                parts,
                epilogue: rd.epilogue().to_vec(),
            }
        };
        for part in &mut resolved.parts {
            part.materialize(codec)?;
        }
        self.body = Body::Multipart(resolved);
        Ok(())
    }
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one entity from `input`: a header block, then the body.
    /// A multipart body is not demuxed here; its children come lazily
    /// from `multipart_reader` (or eagerly from `parse_tree`).
    pub fn parse(&self, input: &[u8]) -> Result<Entity> {
        let HeaderParseResult { store, body_offset } =
            parse_header(input, self.options.max_header_bytes)?;
        Ok(self.new_entity(store, &input[body_offset..]))
    }

    /// Parse and recursively materialize the whole entity tree
    pub fn parse_tree(&self, input: &[u8]) -> Result<Entity> {
        let mut entity = self.parse(input)?;
        entity.materialize(self)?;
        Ok(entity)
    }

    /// Build an entity from a parsed header and its raw body bytes.
    /// The body is decoded through the transfer-encoding and charset
    /// registries; decode problems are recorded as the entity's
    /// defect, never raised, so the caller always gets a usable body.
    pub fn new_entity(&self, header: HeaderStore, raw_body: &[u8]) -> Entity {
        let (ct, ct_err) = match header.get("Content-Type") {
            Some(v) => {
                let (ct, err) = MediaParams::parse(v, &self.charsets);
                (Some(ct), err)
            }
            None => (None, None),
        };
        let mut defect = ct_err;

        if ct.as_ref().is_some_and(|ct| ct.is_multipart()) {
            return Entity {
                header,
                raw_body: Some(raw_body.to_vec()),
                body: Body::Deferred,
                defect,
            };
        }

        let cte = header.get("Content-Transfer-Encoding").unwrap_or("");
        let (decoded, enc_err) = self.encodings.decode(cte, raw_body);
        if defect.is_none() {
            defect = enc_err;
        }

        // Charset conversion applies whenever the Content-Type names
        // one, whatever the media type
        let data = match ct.as_ref().and_then(|ct| ct.get("charset")) {
            Some(cs) => match self.charsets.decode(cs, &decoded) {
                Ok(text) => text.into_bytes(),
                Err(err) => {
                    tracing::debug!("body charset did not decode: {err}");
                    if defect.is_none() {
                        defect = Some(err);
                    }
                    decoded
                }
            },
            _ => decoded,
        };

        Entity {
            header,
            raw_body: Some(raw_body.to_vec()),
            body: Body::Data(data),
            defect,
        }
    }

    /// Build a multipart entity from a header (whose Content-Type
    /// must already be `multipart/*`) and its children. A boundary is
    /// generated and written into the header if it has none.
    pub fn new_multipart(&self, header: HeaderStore, parts: Vec<Entity>) -> Result<Entity> {
        let Some(ct_value) = header.get("Content-Type") else {
            return Err(MimeError::NotMultipart);
        };
        let (mut ct, _) = MediaParams::parse(ct_value, &self.charsets);
        if !ct.is_multipart() {
            return Err(MimeError::NotMultipart);
        }

        let mut header = header;
        if ct.get("boundary").is_none() {
            let uuid = uuid::Uuid::new_v4();
            let boundary = data_encoding::BASE64_NOPAD.encode(uuid.as_bytes());
            ct.set("boundary", &boundary);
            header.set("Content-Type", &ct.encode_value());
        }

        Ok(Entity {
            header,
            raw_body: None,
            body: Body::Multipart(MultipartBody {
                parts,
                ..MultipartBody::default()
            }),
            defect: None,
        })
    }

    fn ensure_boundary(&self, entity: &mut Entity) {
        let Some(mut ct) = entity.content_type(&self.charsets) else {
            return;
        };
        if ct.is_multipart() && ct.get("boundary").is_none() {
            let uuid = uuid::Uuid::new_v4();
            let boundary = data_encoding::BASE64_NOPAD.encode(uuid.as_bytes());
            ct.set("boundary", &boundary);
            entity.header.set("Content-Type", &ct.encode_value());
        }
    }

    /// Serialize an entity: header block, blank line, body. An
    /// unmutated parsed entity reproduces its input bytes exactly.
    /// Returns the recoverable encode problems hit along the way
    /// (each already worked around); fatal I/O errors abort.
    pub fn write_entity<W: Write>(&self, entity: &mut Entity, out: &mut W) -> Result<Vec<MimeError>> {
        let mut warnings = vec![];
        if entity.raw_body.is_none() {
            self.ensure_boundary(entity);
        }
        write_header(&entity.header, out)?;
        self.write_body(entity, out, &mut warnings)?;
        Ok(warnings)
    }

    /// Serialize an entity to bytes
    pub fn entity_to_bytes(&self, entity: &mut Entity) -> Result<(Vec<u8>, Vec<MimeError>)> {
        let mut out = vec![];
        let warnings = self.write_entity(entity, &mut out)?;
        Ok((out, warnings))
    }

    fn write_body<W: Write>(
        &self,
        entity: &mut Entity,
        out: &mut W,
        warnings: &mut Vec<MimeError>,
    ) -> Result<()> {
        if let Some(raw) = &entity.raw_body {
            out.write_all(raw)?;
            return Ok(());
        }

        let ct = entity.content_type(&self.charsets);
        let cte = entity
            .header
            .get("Content-Transfer-Encoding")
            .unwrap_or("")
            .to_string();

        match &mut entity.body {
            Body::Deferred => Ok(()),
            Body::Data(data) => {
                // Symmetric with reading: charset conversion first,
                // then the transfer encoding
                let mut bytes: &[u8] = data;
                let converted;
                if let Some(cs) = ct.as_ref().and_then(|ct| ct.get("charset")) {
                    match self.charsets.encode(cs, &String::from_utf8_lossy(data)) {
                        Ok(enc) => {
                            converted = enc;
                            bytes = &converted;
                        }
                        Err(err) => {
                            tracing::warn!("writing body as utf-8 instead: {err}");
                            warnings.push(err);
                        }
                    }
                }

                let encoded = match self.encodings.encode(&cte, bytes) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        warnings.push(err);
                        bytes.to_vec()
                    }
                };
                out.write_all(&encoded)?;
                Ok(())
            }
            Body::Multipart(mb) => {
                let boundary = ct
                    .as_ref()
                    .and_then(|ct| ct.get("boundary"))
                    .unwrap_or("")
                    .to_string();

                if let Some(preamble) = &mb.preamble {
                    out.write_all(preamble)?;
                    out.write_all(b"\r\n")?;
                }
                for part in &mut mb.parts {
                    write!(out, "--{boundary}\r\n")?;
                    if part.raw_body.is_none() {
                        self.ensure_boundary(part);
                    }
                    write_header(&part.header, out)?;
                    self.write_body(part, out, warnings)?;
                    out.write_all(b"\r\n")?;
                }
                write!(out, "--{boundary}--\r\n")?;
                if !mb.epilogue.is_empty() {
                    out.write_all(&mb.epilogue)?;
                }
                Ok(())
            }
        }
    }

    /// The entity's body as a readable stream: raw bytes for a parsed
    /// entity, or serialized lazily on first read by a producer
    /// thread for a constructed tree
    pub fn body_stream(&self, entity: &mut Entity) -> StreamBridge {
        self.ensure_boundary(entity);
        let codec = self.clone();
        let mut entity = entity.clone();
        StreamBridge::new(move |w| {
            let mut warnings = vec![];
            codec.write_body(&mut entity, w, &mut warnings)?;
            Ok(())
        })
    }
}

/// Iterative pre-order walk over an entity tree. `visit` receives the
/// path of zero-based child indices from the root (empty for the root
/// itself) and the node. Revisiting the same node object fails with
/// `CyclicEntity` instead of looping.
pub fn walk<F>(root: &Entity, mut visit: F) -> Result<()>
where
    F: FnMut(&[usize], &Entity) -> Result<()>,
{
    let mut stack: Vec<(&Entity, Vec<usize>)> = vec![(root, vec![])];
    let mut seen: HashSet<*const Entity> = HashSet::new();

    while let Some((node, path)) = stack.pop() {
        if !seen.insert(node as *const Entity) {
            return Err(MimeError::CyclicEntity);
        }
        visit(&path, node)?;

        if let Some(parts) = node.parts() {
            for (idx, child) in parts.iter().enumerate().rev() {
                let mut child_path = path.clone();
                child_path.push(idx);
                stack.push((child, child_path));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::header_to_bytes;
    use std::io::Read;

    const NESTED: &str = concat!(
        "MIME-Version: 1.0\r\n",
        "Subject: hello\r\n",
        "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
        "\r\n",
        "preamble text\r\n",
        "--outer\r\n",
        "Content-Type: text/plain; charset=\"windows-1252\"\r\n",
        "Content-Transfer-Encoding: quoted-printable\r\n",
        "\r\n",
        "caf=E9 =80\r\n",
        "--outer\r\n",
        "Content-Type: multipart/alternative; boundary=inner\r\n",
        "\r\n",
        "--inner\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "plain\r\n",
        "--inner\r\n",
        "Content-Type: text/html\r\n",
        "\r\n",
        "<p>html</p>\r\n",
        "--inner--\r\n",
        "\r\n",
        "--outer--\r\n",
        "epilogue\r\n",
    );

    #[test]
    fn parse_decodes_encoding_then_charset() {
        let codec = Codec::new();
        let input = concat!(
            "Content-Type: text/plain; charset=\"windows-1252\"\r\n",
            "Content-Transfer-Encoding: quoted-printable\r\n",
            "\r\n",
            "caf=E9 =80",
        );
        let entity = codec.parse(input.as_bytes()).unwrap();
        k9::assert_equal!(entity.defect(), None);
        k9::assert_equal!(entity.text_body(), "café €");
    }

    #[test]
    fn charset_applies_to_non_text_types() {
        let codec = Codec::new();
        let input = b"Content-Type: application/json; charset=\"windows-1252\"\r\n\r\n{\"k\":\"caf\xE9\"}";
        let mut entity = codec.parse(input.as_slice()).unwrap();
        k9::assert_equal!(entity.defect(), None);
        k9::assert_equal!(entity.text_body(), "{\"k\":\"café\"}");

        // And symmetrically on write after a mutation
        entity.set_text_body("{\"k\":\"caf\u{e9} latt\u{e8}\"}");
        let (out, warnings) = codec.entity_to_bytes(&mut entity).unwrap();
        k9::assert_equal!(warnings, vec![]);
        assert!(out.ends_with(b"{\"k\":\"caf\xE9 latt\xE8\"}"));
    }

    #[test]
    fn multipart_without_boundary_is_not_demuxable() {
        let codec = Codec::new();
        let entity = codec
            .parse(b"Content-Type: multipart/mixed\r\n\r\nnot really parts")
            .unwrap();
        let err = entity.multipart_reader(&codec).unwrap_err();
        k9::assert_equal!(err, MimeError::NotMultipart);
    }

    #[test]
    fn blank_preamble_line_survives_mutation() {
        let codec = Codec::new();
        let input = concat!(
            "Content-Type: multipart/mixed; boundary=b\r\n",
            "\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "one\r\n",
            "--b--\r\n",
        );
        let mut tree = codec.parse_tree(input.as_bytes()).unwrap();
        tree.parts_mut().unwrap()[0].set_text_body("two");

        let (out, warnings) = codec.entity_to_bytes(&mut tree).unwrap();
        k9::assert_equal!(warnings, vec![]);
        let text = String::from_utf8(out).unwrap();
        // The empty preamble region keeps its line before the first
        // boundary
        assert!(text.contains("boundary=b\r\n\r\n\r\n--b\r\n"), "{text:?}");
        k9::assert_equal!(
            codec.parse_tree(text.as_bytes()).unwrap().parts().unwrap()[0].text_body(),
            "two"
        );
    }

    #[test]
    fn unknown_encoding_is_a_defect_not_a_failure() {
        let codec = Codec::new();
        let input = b"Content-Transfer-Encoding: x-enigma\r\n\r\npayload";
        let entity = codec.parse(input).unwrap();
        assert!(entity.defect().is_some_and(|e| e.is_unknown_encoding()));
        k9::assert_equal!(entity.body_bytes(), b"payload".as_slice());
    }

    #[test]
    fn unknown_charset_is_a_defect_not_a_failure() {
        let codec = Codec::new();
        let input = b"Content-Type: text/plain; charset=x-mystery\r\n\r\nbytes as-is";
        let entity = codec.parse(input).unwrap();
        assert!(entity.defect().is_some_and(|e| e.is_unknown_charset()));
        k9::assert_equal!(entity.body_bytes(), b"bytes as-is".as_slice());
    }

    #[test]
    fn multipart_roundtrip_is_byte_exact() {
        let codec = Codec::new();
        let mut entity = codec.parse(NESTED.as_bytes()).unwrap();
        let (out, warnings) = codec.entity_to_bytes(&mut entity).unwrap();
        k9::assert_equal!(warnings, vec![]);
        k9::assert_equal!(String::from_utf8(out).unwrap(), NESTED);

        // Materializing the tree must not disturb the raw bytes
        let mut tree = codec.parse_tree(NESTED.as_bytes()).unwrap();
        let (out, _) = codec.entity_to_bytes(&mut tree).unwrap();
        k9::assert_equal!(String::from_utf8(out).unwrap(), NESTED);
    }

    #[test]
    fn parse_tree_materializes_children() {
        let codec = Codec::new();
        let tree = codec.parse_tree(NESTED.as_bytes()).unwrap();
        let parts = tree.parts().unwrap();
        k9::assert_equal!(parts.len(), 2);
        k9::assert_equal!(parts[0].text_body(), "café €");

        let inner = parts[1].parts().unwrap();
        k9::assert_equal!(inner.len(), 2);
        k9::assert_equal!(inner[0].text_body(), "plain");
        k9::assert_equal!(inner[1].text_body(), "<p>html</p>");
    }

    #[test]
    fn mutated_child_is_reencoded() {
        let codec = Codec::new();
        let mut tree = codec.parse_tree(NESTED.as_bytes()).unwrap();
        tree.parts_mut().unwrap()[0].set_text_body("fresh text");

        let (out, warnings) = codec.entity_to_bytes(&mut tree).unwrap();
        k9::assert_equal!(warnings, vec![]);

        let again = codec.parse_tree(&out).unwrap();
        let parts = again.parts().unwrap();
        k9::assert_equal!(parts[0].text_body(), "fresh text");
        // Untouched siblings survive intact
        k9::assert_equal!(parts[1].parts().unwrap()[1].text_body(), "<p>html</p>");
    }

    #[test]
    fn body_mut_switches_to_reencode() {
        let codec = Codec::new();
        let mut entity = codec.parse(b"Content-Type: text/plain\r\n\r\nold").unwrap();
        *entity.body_mut() = Body::Data(b"new".to_vec());
        let (out, _) = codec.entity_to_bytes(&mut entity).unwrap();
        assert!(out.ends_with(b"\r\nnew"));
    }

    #[test]
    fn read_options_from_config() {
        let opts: ReadOptions = serde_json::from_str("{}").unwrap();
        k9::assert_equal!(opts, ReadOptions::default());
        let opts: ReadOptions = serde_json::from_str(r#"{"max_header_bytes": -1}"#).unwrap();
        k9::assert_equal!(opts.max_header_bytes, -1);
    }

    #[test]
    fn header_budget_applies_to_parse() {
        let mut codec = Codec::new();
        codec.options.max_header_bytes = 16;
        let err = codec.parse(b"Subject: a very long header line\r\n\r\n").unwrap_err();
        k9::assert_equal!(err, MimeError::HeaderTooBig(16));

        codec.options.max_header_bytes = -1;
        assert!(codec.parse(b"Subject: a very long header line\r\n\r\n").is_ok());
    }

    #[test]
    fn new_multipart_generates_and_records_a_boundary() {
        let codec = Codec::new();
        let mut header = HeaderStore::new();
        header.add("Content-Type", "multipart/mixed");

        let children = vec![
            Entity::text("text/plain", "one"),
            Entity::text("text/plain", "two"),
        ];
        let mut entity = codec.new_multipart(header, children).unwrap();

        let ct = entity.content_type(&codec.charsets).unwrap();
        let boundary = ct.get("boundary").unwrap().to_string();
        assert!(!boundary.is_empty());

        let (out, warnings) = codec.entity_to_bytes(&mut entity).unwrap();
        k9::assert_equal!(warnings, vec![]);
        assert!(String::from_utf8_lossy(&out).contains(&format!("--{boundary}--")));

        let again = codec.parse_tree(&out).unwrap();
        let parts = again.parts().unwrap();
        k9::assert_equal!(parts.len(), 2);
        k9::assert_equal!(parts[0].text_body(), "one");
        k9::assert_equal!(parts[1].text_body(), "two");
    }

    #[test]
    fn new_multipart_rejects_non_multipart_types() {
        let codec = Codec::new();
        let mut header = HeaderStore::new();
        header.add("Content-Type", "text/plain");
        let err = codec.new_multipart(header, vec![]).unwrap_err();
        k9::assert_equal!(err, MimeError::NotMultipart);
    }

    #[test]
    fn walk_visits_in_document_order() {
        let codec = Codec::new();

        let mut inner_header = HeaderStore::new();
        inner_header.add("Content-Type", "multipart/alternative");
        let inner = codec
            .new_multipart(
                inner_header,
                vec![
                    Entity::text("text/plain", "nested a"),
                    Entity::text("text/html", "nested b"),
                ],
            )
            .unwrap();

        let mut header = HeaderStore::new();
        header.add("Content-Type", "multipart/mixed");
        let root = codec
            .new_multipart(
                header,
                vec![
                    Entity::text("text/plain", "first"),
                    inner,
                    Entity::text("text/plain", "last"),
                ],
            )
            .unwrap();

        let mut paths: Vec<Vec<usize>> = vec![];
        walk(&root, |path, _entity| {
            paths.push(path.to_vec());
            Ok(())
        })
        .unwrap();

        k9::assert_equal!(
            paths,
            vec![
                vec![],
                vec![0],
                vec![1],
                vec![1, 0],
                vec![1, 1],
                vec![2],
            ]
        );

        k9::assert_equal!(root.at_path(&[]).unwrap().parts().unwrap().len(), 3);
        k9::assert_equal!(root.at_path(&[0]).unwrap().text_body(), "first");
        k9::assert_equal!(root.at_path(&[1, 1]).unwrap().text_body(), "nested b");
        assert!(root.at_path(&[3]).is_none());
        assert!(root.at_path(&[0, 0]).is_none());
    }

    #[test]
    fn walk_propagates_visitor_errors() {
        let entity = Entity::text("text/plain", "x");
        let err = walk(&entity, |_, _| Err(MimeError::CyclicEntity)).unwrap_err();
        k9::assert_equal!(err, MimeError::CyclicEntity);
    }

    #[test]
    fn body_stream_matches_direct_serialization() {
        let codec = Codec::new();
        let mut header = HeaderStore::new();
        header.add("Content-Type", "multipart/mixed");
        let mut entity = codec
            .new_multipart(
                header,
                vec![
                    Entity::text("text/plain", "streamed one"),
                    Entity::text("text/plain", "streamed twö"),
                ],
            )
            .unwrap();

        let mut streamed = vec![];
        codec
            .body_stream(&mut entity)
            .read_to_end(&mut streamed)
            .unwrap();

        let (direct, _) = codec.entity_to_bytes(&mut entity).unwrap();
        let header_bytes = header_to_bytes(entity.header());
        k9::assert_equal!(
            [header_bytes, streamed].concat(),
            direct
        );
    }

    #[test]
    fn text_constructor_picks_an_encoding() {
        let codec = Codec::new();

        let mut plain = Entity::text("text/plain", "just ascii text");
        k9::assert_equal!(plain.header().get("Content-Transfer-Encoding"), None);
        let (out, _) = codec.entity_to_bytes(&mut plain).unwrap();
        assert!(out.ends_with(b"\r\njust ascii text"));

        let mut accented = Entity::text("text/plain", "caf\u{e9} forever");
        k9::assert_equal!(
            accented.header().get("Content-Transfer-Encoding"),
            Some("quoted-printable")
        );
        let (out, warnings) = codec.entity_to_bytes(&mut accented).unwrap();
        k9::assert_equal!(warnings, vec![]);
        let back = codec.parse(&out).unwrap();
        k9::assert_equal!(back.text_body(), "caf\u{e9} forever");
    }

    #[test]
    fn charset_encode_failure_is_a_warning() {
        let codec = Codec::new();
        let mut entity = Entity::text("text/plain", "snowman \u{2603}");
        let mut ct = entity.content_type(&codec.charsets).unwrap();
        ct.set("charset", "iso-8859-1");
        entity.header_mut().set("Content-Type", &ct.encode_value());

        let (out, warnings) = codec.entity_to_bytes(&mut entity).unwrap();
        k9::assert_equal!(warnings.len(), 1);
        assert!(warnings[0].is_recoverable());
        // Fallback body is still written
        assert!(!out.is_empty());
    }
}
