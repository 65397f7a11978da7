use std::io::{self, Read, Write};

enum Chunk {
    Data(Vec<u8>),
    Failed(String),
}

/// The write end of a bridge, handed to the producer. Writes block
/// until the consumer drains them; once the consumer is gone, writes
/// fail with `BrokenPipe`, which unwinds the producer promptly.
pub struct BridgeWriter {
    tx: flume::Sender<Chunk>,
}

impl Write for BridgeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Chunk::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "bridge consumer closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type Producer = Box<dyn FnOnce(&mut BridgeWriter) -> crate::Result<()> + Send + 'static>;

/// Single-slot handoff pipe turning a push-style serializer into a
/// readable stream. The producer runs on its own thread, spawned
/// lazily by the first `read`; it blocks on each write until the
/// consumer catches up, so no more than one chunk is in flight.
/// A producer error is delivered to the consumer as a terminal read
/// error, and dropping the consumer cancels the producer.
pub struct StreamBridge {
    producer: Option<Producer>,
    rx: Option<flume::Receiver<Chunk>>,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl StreamBridge {
    pub fn new<F>(producer: F) -> Self
    where
        F: FnOnce(&mut BridgeWriter) -> crate::Result<()> + Send + 'static,
    {
        Self {
            producer: Some(Box::new(producer)),
            rx: None,
            buf: vec![],
            pos: 0,
            done: false,
        }
    }

    fn ensure_started(&mut self) {
        if let Some(producer) = self.producer.take() {
            let (tx, rx) = flume::bounded(0);
            self.rx = Some(rx);
            std::thread::spawn(move || {
                let mut w = BridgeWriter { tx };
                if let Err(err) = producer(&mut w) {
                    tracing::debug!("bridge producer failed: {err}");
                    // The consumer may already be gone
                    let _ = w.tx.send(Chunk::Failed(err.to_string()));
                }
            });
        }
    }
}

impl Read for StreamBridge {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.done || out.is_empty() {
            return Ok(0);
        }
        self.ensure_started();

        loop {
            if self.pos < self.buf.len() {
                let n = (self.buf.len() - self.pos).min(out.len());
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            let Some(rx) = &self.rx else {
                return Ok(0);
            };
            match rx.recv() {
                Ok(Chunk::Data(data)) => {
                    self.buf = data;
                    self.pos = 0;
                }
                Ok(Chunk::Failed(msg)) => {
                    self.done = true;
                    return Err(io::Error::new(io::ErrorKind::Other, msg));
                }
                // Producer finished and closed its end
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
    }
}
