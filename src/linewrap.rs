use std::io::{self, Write};

/// Wraps its input at `max_line_len` octets, emitting CRLF line
/// endings. The writer is stateful across calls: output depends only
/// on the byte sequence written, never on how it was chunked.
pub struct LineWrapWriter<W> {
    inner: W,
    max_line_len: usize,
    cur_line_len: usize,
    /// The previous write ended on a bare CR; the LF may still arrive
    /// in the next chunk
    cr: bool,
}

impl<W: Write> LineWrapWriter<W> {
    pub fn new(inner: W, max_line_len: usize) -> Self {
        Self {
            inner,
            max_line_len,
            cur_line_len: 0,
            cr: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Cut the leading line out of `b`: everything through the first LF,
/// or `max` octets when no LF appears early enough. A CR sitting
/// exactly on the limit is allowed through so a CRLF pair is never
/// split.
fn cut_line(b: &[u8], max: usize) -> (&[u8], &[u8]) {
    for (i, &c) in b.iter().enumerate() {
        if c == b'\r' && i == max {
            continue;
        }
        if c == b'\n' {
            return b.split_at(i + 1);
        }
        if i >= max {
            return b.split_at(i);
        }
    }
    (b, &[])
}

impl<W: Write> Write for LineWrapWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut b = buf;
        while !b.is_empty() {
            // After a CR allowed through at the limit the current
            // line is one over; saturate so the next cut happens
            // immediately
            let budget = self.max_line_len.saturating_sub(self.cur_line_len);
            let (mut line, rest) = cut_line(b, budget);
            b = rest;

            let had_lf = line.ends_with(b"\n");
            if had_lf {
                line = &line[..line.len() - 1];
            }
            self.inner.write_all(line)?;

            let mut cr = line.ends_with(b"\r");
            if line.is_empty() {
                cr = self.cr;
            }

            if !had_lf && b.is_empty() {
                self.cur_line_len += line.len();
                self.cr = cr;
                break;
            }
            self.cur_line_len = 0;

            // When the CR is already down, only the LF is owed
            self.inner.write_all(if cr { b"\n" } else { b"\r\n" })?;
            self.cr = false;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming base64 encoder. Bytes arrive in arbitrary chunks; full
/// 3-byte groups are encoded as they complete and up to two bytes are
/// carried between calls. `finish` emits the final padded group.
pub struct Base64Writer<W> {
    inner: W,
    carry: [u8; 3],
    carry_len: usize,
}

impl<W: Write> Base64Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            carry: [0u8; 3],
            carry_len: 0,
        }
    }

    pub fn finish(mut self) -> io::Result<W> {
        if self.carry_len > 0 {
            let encoded = data_encoding::BASE64.encode(&self.carry[..self.carry_len]);
            self.inner.write_all(encoded.as_bytes())?;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for Base64Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut b = buf;

        // Top up the carried partial group first
        if self.carry_len > 0 {
            let take = (3 - self.carry_len).min(b.len());
            self.carry[self.carry_len..self.carry_len + take].copy_from_slice(&b[..take]);
            self.carry_len += take;
            b = &b[take..];
            if self.carry_len < 3 {
                return Ok(buf.len());
            }
            let encoded = data_encoding::BASE64.encode(&self.carry);
            self.inner.write_all(encoded.as_bytes())?;
            self.carry_len = 0;
        }

        let whole = b.len() - b.len() % 3;
        if whole > 0 {
            let encoded = data_encoding::BASE64.encode(&b[..whole]);
            self.inner.write_all(encoded.as_bytes())?;
        }

        let rem = &b[whole..];
        self.carry[..rem.len()].copy_from_slice(rem);
        self.carry_len = rem.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn wrap_chunked(data: &[u8], max: usize, chunk: usize) -> Vec<u8> {
        let mut w = LineWrapWriter::new(Vec::new(), max);
        for piece in data.chunks(chunk.max(1)) {
            w.write_all(piece).unwrap();
        }
        w.into_inner()
    }

    #[test]
    fn wraps_long_runs() {
        let data = vec![b'x'; 20];
        let out = wrap_chunked(&data, 8, data.len());
        k9::assert_equal!(
            String::from_utf8(out).unwrap(),
            "xxxxxxxx\r\nxxxxxxxx\r\nxxxx"
        );
    }

    #[test]
    fn existing_line_breaks_reset_the_count() {
        let out = wrap_chunked(b"ab\r\ncdefgh", 6, 100);
        k9::assert_equal!(String::from_utf8(out).unwrap(), "ab\r\ncdefgh");
    }

    #[test]
    fn output_is_chunking_independent() {
        let mut data = Vec::new();
        for i in 0..400u32 {
            data.extend_from_slice(format!("item {i}\r\n").as_bytes());
            if i % 7 == 0 {
                data.extend_from_slice(&[b'z'; 90]);
            }
        }
        let whole = wrap_chunked(&data, 76, data.len());
        for chunk in [1, 2, 3, 5, 76, 77] {
            k9::assert_equal!(wrap_chunked(&data, 76, chunk), whole, "chunk size {chunk}");
        }
    }

    #[test]
    fn crlf_split_across_writes() {
        // CR in one call, LF in the next: still a single line ending
        let mut w = LineWrapWriter::new(Vec::new(), 10);
        w.write_all(b"abc\r").unwrap();
        w.write_all(b"\ndef").unwrap();
        k9::assert_equal!(w.into_inner(), b"abc\r\ndef".to_vec());
    }

    #[test]
    fn cr_exactly_on_the_limit() {
        let out = wrap_chunked(b"abcdef\r\ng", 6, 100);
        k9::assert_equal!(String::from_utf8(out).unwrap(), "abcdef\r\ng");
    }

    #[test]
    fn base64_writer_matches_whole_buffer_encode() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let reference = {
            let mut w = LineWrapWriter::new(Vec::new(), 76);
            w.write_all(data_encoding::BASE64.encode(&data).as_bytes())
                .unwrap();
            w.into_inner()
        };

        for chunk in [1, 2, 3, 4, 7, 500] {
            let mut w = Base64Writer::new(LineWrapWriter::new(Vec::new(), 76));
            for piece in data.chunks(chunk) {
                w.write_all(piece).unwrap();
            }
            let out = w.finish().unwrap().into_inner();
            k9::assert_equal!(out, reference, "chunk size {chunk}");
        }
    }

    #[test]
    fn base64_writer_pads_final_group() {
        let mut w = Base64Writer::new(Vec::new());
        w.write_all(b"hi").unwrap();
        let out = w.finish().unwrap();
        k9::assert_equal!(out, b"aGk=".to_vec());
    }
}
