use crate::encoding::{normalize_encoding, EncodingRegistry, TransferCodec};
use crate::entity::{Codec, Entity};
use crate::header::write_header;
use crate::headerstore::HeaderStore;
use crate::linewrap::{Base64Writer, LineWrapWriter};
use crate::{MimeError, Result};
use memchr::memmem;
use std::io::{self, Write};
use std::sync::Arc;

/// Demuxes the boundary-delimited parts of a multipart body. The body
/// bytes are segmented up front; child entities are constructed
/// lazily, one per `next` call, and a missing terminal boundary
/// surfaces as an error after the final part.
#[derive(Debug)]
pub struct MultipartReader<'a> {
    codec: &'a Codec,
    parts: Source<'a>,
    /// `None` when the opening boundary sat at the very start of the
    /// body; `Some` (possibly empty) when a preamble region preceded
    /// it, so its delimiting CRLF can be reproduced
    preamble: Option<&'a [u8]>,
    epilogue: &'a [u8],
    truncated: bool,
}

#[derive(Debug)]
enum Source<'a> {
    /// Boundary-delimited chunks still to be parsed
    Raw(std::vec::IntoIter<&'a [u8]>),
    /// Children that were already materialized
    Built(std::vec::IntoIter<Entity>),
}

fn strip_trailing_crlf(b: &[u8]) -> &[u8] {
    let b = b.strip_suffix(b"\n").unwrap_or(b);
    b.strip_suffix(b"\r").unwrap_or(b)
}

impl<'a> MultipartReader<'a> {
    pub fn new(codec: &'a Codec, boundary: &str, raw: &'a [u8]) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 3);
        marker.extend_from_slice(b"\n--");
        marker.extend_from_slice(boundary.as_bytes());

        // Candidate delimiters: the start of the buffer, plus every
        // later line starting with the dashed boundary
        let mut candidates: Vec<usize> = vec![];
        if raw.starts_with(&marker[1..]) {
            candidates.push(0);
        }
        candidates.extend(memmem::find_iter(raw, &marker).map(|i| i + 1));

        let mut preamble: Option<&[u8]> = None;
        let mut epilogue: &[u8] = b"";
        let mut parts: Vec<&[u8]> = vec![];
        let mut truncated = false;

        // Where the current part's content starts, once the opening
        // delimiter has been seen
        let mut content_start: Option<usize> = None;
        let mut terminated = false;
        let mut seen_open = false;

        for line_start in candidates {
            if terminated {
                break;
            }
            let tail = &raw[line_start + marker.len() - 1..];
            let terminal = tail.starts_with(b"--");
            let tail = if terminal { &tail[2..] } else { tail };

            // Transport padding between the boundary and the line end
            let pad = tail
                .iter()
                .take_while(|&&b| b == b' ' || b == b'\t')
                .count();
            let tail = &tail[pad..];
            let line_len = raw.len() - line_start - tail.len();
            let after_line = if tail.starts_with(b"\r\n") {
                line_start + line_len + 2
            } else if tail.starts_with(b"\n") {
                line_start + line_len + 1
            } else if tail.is_empty() {
                raw.len()
            } else {
                // The boundary is a prefix of a longer token on this
                // line; not a delimiter
                continue;
            };

            // Close out whatever ran up to this delimiter line. The
            // CRLF before the boundary belongs to the delimiter.
            let before = strip_trailing_crlf(&raw[..line_start]);
            match content_start {
                Some(start) => parts.push(strip_trailing_crlf(&raw[start..line_start])),
                None if line_start > 0 => preamble = Some(before),
                None => {}
            }

            if terminal {
                epilogue = &raw[after_line..];
                terminated = true;
            } else {
                seen_open = true;
                content_start = Some(after_line);
            }
        }

        if !terminated {
            if let Some(start) = content_start {
                parts.push(strip_trailing_crlf(&raw[start..]));
            } else if !seen_open && !raw.is_empty() {
                preamble = Some(strip_trailing_crlf(raw));
            }
            truncated = true;
        }

        Self {
            codec,
            parts: Source::Raw(parts.into_iter()),
            preamble,
            epilogue,
            truncated,
        }
    }

    /// A reader over children that already exist as entities
    pub(crate) fn over_parts(codec: &'a Codec, parts: Vec<Entity>) -> Self {
        Self {
            codec,
            parts: Source::Built(parts.into_iter()),
            preamble: None,
            epilogue: b"",
            truncated: false,
        }
    }

    /// Bytes before the first boundary, when a preamble region was
    /// present at all
    pub fn preamble(&self) -> Option<&'a [u8]> {
        self.preamble
    }

    /// Bytes after the terminal boundary
    pub fn epilogue(&self) -> &'a [u8] {
        self.epilogue
    }

    /// The next child entity, `None` at the end of parts
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<Entity>> {
        let next = match &mut self.parts {
            Source::Raw(chunks) => chunks.next().map(|raw| self.codec.parse(raw)),
            Source::Built(parts) => parts.next().map(Ok),
        };
        match next {
            Some(part) => Some(part),
            None => {
                if self.truncated {
                    self.truncated = false;
                    Some(Err(MimeError::TruncatedMultipart))
                } else {
                    None
                }
            }
        }
    }
}

impl Iterator for MultipartReader<'_> {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        MultipartReader::next(self)
    }
}

/// Serializes a multipart body one part at a time. Each part's body
/// is passed through the transfer encoding its header names, and
/// `finish` writes the terminal boundary.
pub struct MultipartWriter<W: Write> {
    out: W,
    boundary: String,
    encodings: EncodingRegistry,
    wrote_part: bool,
}

impl<W: Write> MultipartWriter<W> {
    pub fn new(out: W, boundary: &str, codec: &Codec) -> Self {
        Self {
            out,
            boundary: boundary.to_string(),
            encodings: codec.encodings.clone(),
            wrote_part: false,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Emit the preamble text that precedes the first boundary.
    /// Only meaningful before any part has been created.
    pub fn write_preamble(&mut self, preamble: &[u8]) -> Result<()> {
        self.out.write_all(preamble)?;
        self.out.write_all(b"\r\n")?;
        Ok(())
    }

    /// Open the next part: writes the dashed boundary and `header`,
    /// and returns a writer that encodes the part body per the
    /// header's Content-Transfer-Encoding
    pub fn create_part(&mut self, header: &HeaderStore) -> Result<PartWriter<'_, W>> {
        if self.wrote_part {
            self.out.write_all(b"\r\n")?;
        }
        self.wrote_part = true;
        write!(self.out, "--{}\r\n", self.boundary)?;
        write_header(header, &mut self.out)?;

        let cte = header.get("Content-Transfer-Encoding").unwrap_or("");
        let norm = normalize_encoding(cte);
        let enc = if let Some(codec) = self.encodings.custom(&norm) {
            PartEncoder::Custom {
                codec,
                out: &mut self.out,
                buf: vec![],
            }
        } else {
            match norm.as_str() {
                "quoted-printable" => PartEncoder::QuotedPrintable {
                    out: &mut self.out,
                    buf: vec![],
                },
                "base64" => PartEncoder::Base64(Base64Writer::new(LineWrapWriter::new(
                    &mut self.out,
                    76,
                ))),
                "7bit" | "7-bit" | "8bit" | "8-bit" | "utf8" | "utf-8" => {
                    PartEncoder::Wrapped(LineWrapWriter::new(&mut self.out, 998))
                }
                _ => PartEncoder::Identity(&mut self.out),
            }
        };
        Ok(PartWriter { enc })
    }

    /// Write the terminal boundary and hand back the sink
    pub fn finish(mut self) -> Result<W> {
        if self.wrote_part {
            self.out.write_all(b"\r\n")?;
        }
        write!(self.out, "--{}--\r\n", self.boundary)?;
        Ok(self.out)
    }
}

enum PartEncoder<'a, W: Write> {
    Identity(&'a mut W),
    Wrapped(LineWrapWriter<&'a mut W>),
    Base64(Base64Writer<LineWrapWriter<&'a mut W>>),
    QuotedPrintable {
        out: &'a mut W,
        buf: Vec<u8>,
    },
    Custom {
        codec: Arc<dyn TransferCodec>,
        out: &'a mut W,
        buf: Vec<u8>,
    },
}

/// Writes one part's body through its transfer encoding. Must be
/// closed to flush any buffered tail.
pub struct PartWriter<'a, W: Write> {
    enc: PartEncoder<'a, W>,
}

impl<W: Write> Write for PartWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.enc {
            PartEncoder::Identity(w) => w.write(buf),
            PartEncoder::Wrapped(w) => w.write(buf),
            PartEncoder::Base64(w) => w.write(buf),
            PartEncoder::QuotedPrintable { buf: b, .. }
            | PartEncoder::Custom { buf: b, .. } => {
                b.extend_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.enc {
            PartEncoder::Identity(w) => w.flush(),
            PartEncoder::Wrapped(w) => w.flush(),
            PartEncoder::Base64(w) => w.flush(),
            _ => Ok(()),
        }
    }
}

impl<W: Write> PartWriter<'_, W> {
    pub fn close(self) -> Result<()> {
        match self.enc {
            PartEncoder::Identity(_) | PartEncoder::Wrapped(_) => Ok(()),
            PartEncoder::Base64(w) => {
                w.finish()?;
                Ok(())
            }
            PartEncoder::QuotedPrintable { out, buf } => {
                out.write_all(&crate::quotedprintable::encode(&buf))?;
                Ok(())
            }
            PartEncoder::Custom { codec, out, buf } => {
                out.write_all(&codec.encode(&buf))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::parse_header;

    const SIMPLE: &str = concat!(
        "This is the preamble.\r\n",
        "--frontier\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "first part\r\n",
        "--frontier\r\n",
        "Content-Type: text/html\r\n",
        "\r\n",
        "<b>second part</b>\r\n",
        "--frontier--\r\n",
        "the epilogue\r\n",
    );

    #[test]
    fn reads_parts_in_order() {
        let codec = Codec::new();
        let mut rd = MultipartReader::new(&codec, "frontier", SIMPLE.as_bytes());
        k9::assert_equal!(rd.preamble(), Some(b"This is the preamble.".as_slice()));

        let p1 = rd.next().unwrap().unwrap();
        k9::assert_equal!(p1.header().get("Content-Type"), Some("text/plain"));
        k9::assert_equal!(p1.text_body(), "first part");

        let p2 = rd.next().unwrap().unwrap();
        k9::assert_equal!(p2.text_body(), "<b>second part</b>");

        assert!(rd.next().is_none());
        k9::assert_equal!(rd.epilogue(), b"the epilogue\r\n".as_slice());
    }

    #[test]
    fn boundary_at_start_has_no_preamble() {
        let body = "--b\r\n\r\nx\r\n--b--\r\n";
        let codec = Codec::new();
        let rd = MultipartReader::new(&codec, "b", body.as_bytes());
        k9::assert_equal!(rd.preamble(), None);

        // A bare CRLF before the first boundary is a preamble region,
        // just an empty one
        let body = "\r\n--b\r\n\r\nx\r\n--b--\r\n";
        let rd = MultipartReader::new(&codec, "b", body.as_bytes());
        k9::assert_equal!(rd.preamble(), Some(b"".as_slice()));
    }

    #[test]
    fn boundary_prefix_of_longer_token_is_ignored() {
        let body = concat!(
            "--b\r\n",
            "\r\n",
            "--bogus is not a boundary\r\n",
            "content\r\n",
            "--b--\r\n",
        );
        let codec = Codec::new();
        let mut rd = MultipartReader::new(&codec, "b", body.as_bytes());
        let p = rd.next().unwrap().unwrap();
        k9::assert_equal!(p.text_body(), "--bogus is not a boundary\r\ncontent");
        assert!(rd.next().is_none());
    }

    #[test]
    fn missing_terminal_boundary_is_an_error() {
        let body = concat!(
            "--frontier\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "only part, never closed\r\n",
        );
        let codec = Codec::new();
        let mut rd = MultipartReader::new(&codec, "frontier", body.as_bytes());
        let p = rd.next().unwrap().unwrap();
        k9::assert_equal!(p.text_body(), "only part, never closed");
        let err = rd.next().unwrap().unwrap_err();
        k9::assert_equal!(err, MimeError::TruncatedMultipart);
    }

    #[test]
    fn transport_padding_after_boundary() {
        let body = "--b  \t\r\npart: x\r\n\r\nhello\r\n--b-- \r\n";
        let codec = Codec::new();
        let mut rd = MultipartReader::new(&codec, "b", body.as_bytes());
        let p = rd.next().unwrap().unwrap();
        k9::assert_equal!(p.text_body(), "hello");
        assert!(rd.next().is_none());
    }

    #[test]
    fn writer_produces_readable_output() {
        let codec = Codec::new();
        let mut mw = MultipartWriter::new(Vec::new(), "xyz", &codec);

        let header = parse_header(b"Content-Type: text/plain\r\n\r\n", -1)
            .unwrap()
            .store;
        let mut pw = mw.create_part(&header).unwrap();
        pw.write_all(b"plain text body").unwrap();
        pw.close().unwrap();

        let header = parse_header(
            b"Content-Type: application/octet-stream\r\nContent-Transfer-Encoding: base64\r\n\r\n",
            -1,
        )
        .unwrap()
        .store;
        let mut pw = mw.create_part(&header).unwrap();
        pw.write_all(&[0u8, 1, 2, 3, 4, 5, 6, 7]).unwrap();
        pw.close().unwrap();

        let out = mw.finish().unwrap();

        let mut rd = MultipartReader::new(&codec, "xyz", &out);
        let p1 = rd.next().unwrap().unwrap();
        k9::assert_equal!(p1.text_body(), "plain text body");
        let p2 = rd.next().unwrap().unwrap();
        k9::assert_equal!(p2.body_bytes(), [0u8, 1, 2, 3, 4, 5, 6, 7].as_slice());
        assert!(rd.next().is_none());
    }

    #[test]
    fn nested_multipart_via_writer() {
        let codec = Codec::new();
        let mut outer = MultipartWriter::new(Vec::new(), "outer", &codec);

        let header =
            parse_header(b"Content-Type: multipart/alternative; boundary=inner\r\n\r\n", -1)
                .unwrap()
                .store;
        let mut pw = outer.create_part(&header).unwrap();
        {
            let mut inner = MultipartWriter::new(&mut pw, "inner", &codec);
            let h = parse_header(b"Content-Type: text/plain\r\n\r\n", -1).unwrap().store;
            let mut ipw = inner.create_part(&h).unwrap();
            ipw.write_all(b"inner text").unwrap();
            ipw.close().unwrap();
            inner.finish().unwrap();
        }
        pw.close().unwrap();
        let out = outer.finish().unwrap();

        let mut rd = MultipartReader::new(&codec, "outer", &out);
        let child = rd.next().unwrap().unwrap();
        let mut inner_rd = child.multipart_reader(&codec).unwrap();
        let grandchild = inner_rd.next().unwrap().unwrap();
        k9::assert_equal!(grandchild.text_body(), "inner text");
    }
}
