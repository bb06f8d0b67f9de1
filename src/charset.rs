use encoding_rs::{CoderResult, Decoder, Encoder, Encoding, UTF_8};
use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown character set {label:?}")]
pub struct UnknownCharset {
    pub label: String,
}

/// The charset named by `LANG` (the part after the first `.`), or UTF-8.
pub fn default_label() -> String {
    label_from_lang(std::env::var("LANG").ok().as_deref())
}

fn label_from_lang(lang: Option<&str>) -> String {
    lang.and_then(|lang| lang.split_once('.'))
        .map(|(_, enc)| enc.split('@').next().unwrap_or(enc))
        .filter(|enc| !enc.is_empty())
        .unwrap_or("UTF-8")
        .to_owned()
}

/// Resolves a WHATWG label; an empty label means the locale default.
pub fn lookup(label: &str) -> Result<&'static Encoding, UnknownCharset> {
    let label = label.trim();
    if label.is_empty() {
        let default = default_label();
        return Ok(Encoding::for_label(default.as_bytes()).unwrap_or(UTF_8));
    }
    Encoding::for_label(label.as_bytes()).ok_or_else(|| UnknownCharset {
        label: label.to_owned(),
    })
}

/// Decodes `R` from the given charset into UTF-8 on the fly.
pub struct DecodeReader<R> {
    inner: R,
    decoder: Decoder,
    input: Vec<u8>,
    in_start: usize,
    in_end: usize,
    output: Vec<u8>,
    out_start: usize,
    out_end: usize,
    eof: bool,
    finished: bool,
}

impl<R: Read> DecodeReader<R> {
    pub fn new(inner: R, encoding: &'static Encoding) -> Self {
        DecodeReader {
            inner,
            decoder: encoding.new_decoder(),
            input: vec![0; 8192],
            in_start: 0,
            in_end: 0,
            output: vec![0; 16384],
            out_start: 0,
            out_end: 0,
            eof: false,
            finished: false,
        }
    }
}

impl<R: Read> Read for DecodeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.out_start < self.out_end {
                let n = buf.len().min(self.out_end - self.out_start);
                buf[..n].copy_from_slice(&self.output[self.out_start..self.out_start + n]);
                self.out_start += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            if self.in_start == self.in_end && !self.eof {
                let n = self.inner.read(&mut self.input)?;
                self.in_start = 0;
                self.in_end = n;
                self.eof = n == 0;
            }
            let (result, read, written, _) = self.decoder.decode_to_utf8(
                &self.input[self.in_start..self.in_end],
                &mut self.output,
                self.eof,
            );
            self.in_start += read;
            self.out_start = 0;
            self.out_end = written;
            if self.eof && result == CoderResult::InputEmpty {
                self.finished = true;
            }
        }
    }
}

/// Encodes UTF-8 written into it to the given charset, replacing unmappable characters.
pub struct EncodeWriter<W: Write> {
    inner: W,
    encoder: Option<Encoder>,
    pending: Vec<u8>,
    buf: Vec<u8>,
}

impl<W: Write> EncodeWriter<W> {
    pub fn new(inner: W, encoding: &'static Encoding) -> Self {
        let encoder = if encoding.output_encoding() == UTF_8 {
            None
        } else {
            Some(encoding.new_encoder())
        };
        EncodeWriter {
            inner,
            encoder,
            pending: Vec::new(),
            buf: vec![0; 16384],
        }
    }

    fn encode(&mut self, src: &str, last: bool) -> io::Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return self.inner.write_all(src.as_bytes());
        };
        let mut src = src;
        loop {
            let (result, read, written, _) = encoder.encode_from_utf8(src, &mut self.buf, last);
            self.inner.write_all(&self.buf[..written])?;
            src = &src[read..];
            if result == CoderResult::InputEmpty {
                return Ok(());
            }
        }
    }

    /// Flushes the encoder state and returns the wrapped writer.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.pending.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "incomplete UTF-8 sequence at end of output",
            ));
        }
        self.encode("", true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncodeWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(data);
        let pending = std::mem::take(&mut self.pending);
        let valid = match std::str::from_utf8(&pending) {
            Ok(s) => s.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        };
        // valid_up_to marks a char boundary
        let text = std::str::from_utf8(&pending[..valid])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.encode(text, false)?;
        self.pending = pending[valid..].to_vec();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
