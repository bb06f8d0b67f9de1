//! Content sniffing: which container a byte stream holds, and whether it is
//! compressed. Works on non-seekable streams by recording what it reads and
//! replaying it afterwards.

use flate2::read::MultiGzDecoder;
use std::fmt;
use std::io::{self, Read};

const OLE2_MAGIC: [u8; 4] = [0xd0, 0xcf, 0x11, 0xe0];
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Container {
    #[default]
    Unknown,
    Csv,
    Xls,
    Xlsx,
    Ods,
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Container::Unknown => "unknown",
            Container::Csv => "csv",
            Container::Xls => "xls",
            Container::Xlsx => "xlsx",
            Container::Ods => "ods",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        })
    }
}

/// Container of the fully decompressed content plus the outermost compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FileType {
    pub container: Container,
    pub compression: Compression,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.compression {
            Compression::None => write!(f, "{}", self.container),
            compression => write!(f, "{}+{}", self.container, compression),
        }
    }
}

/// Reader that records everything it reads until [`Replay::rewind`],
/// then serves the recorded bytes again before continuing with the source.
pub struct Replay<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    recording: bool,
}

impl<R: Read> Replay<R> {
    pub fn new(inner: R) -> Self {
        Replay {
            inner,
            buf: Vec::new(),
            pos: 0,
            recording: true,
        }
    }

    pub fn rewind(&mut self) {
        self.recording = false;
        self.pos = 0;
    }

    pub fn recorded(&self) -> &[u8] {
        &self.buf
    }
}

impl<R: Read> Read for Replay<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if !self.recording && self.pos < self.buf.len() {
            let n = out.len().min(self.buf.len() - self.pos);
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            if self.pos == self.buf.len() {
                self.buf = Vec::new();
                self.pos = 0;
            }
            return Ok(n);
        }
        let n = self.inner.read(out)?;
        if self.recording {
            self.buf.extend_from_slice(&out[..n]);
        }
        Ok(n)
    }
}

fn read_magic(r: &mut impl Read) -> io::Result<([u8; 4], usize)> {
    let mut magic = [0u8; 4];
    let mut n = 0;
    while n < magic.len() {
        match r.read(&mut magic[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok((magic, n))
}

fn compression_of(magic: &[u8]) -> Compression {
    if magic.starts_with(&GZIP_MAGIC) {
        Compression::Gzip
    } else if magic.starts_with(&ZSTD_MAGIC) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

fn container_of(magic: &[u8], file_name: &str) -> Container {
    if magic == OLE2_MAGIC {
        Container::Xls
    } else if magic == ZIP_MAGIC {
        if file_name.to_ascii_lowercase().ends_with(".ods") {
            Container::Ods
        } else {
            Container::Xlsx
        }
    } else {
        Container::Csv
    }
}

/// Wraps `r` in the decoder for `compression`.
pub fn decoder<'a, R: Read + 'a>(r: R, compression: Compression) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::None => Box::new(r),
        Compression::Gzip => Box::new(MultiGzDecoder::new(r)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(r)?),
    })
}

// Container of a decompressed stream; undecodable content counts as text.
fn inner_container(r: impl Read, compression: Compression, file_name: &str) -> Container {
    let mut decoded = match decoder(r, compression) {
        Ok(decoded) => decoded,
        Err(err) => {
            log::debug!("{compression} header: {err}, treating as csv");
            return Container::Csv;
        }
    };
    match read_magic(&mut decoded) {
        Ok((magic, n)) => match compression_of(&magic[..n]) {
            Compression::None => container_of(&magic[..n], file_name),
            nested => {
                let rest = io::Cursor::new(magic[..n].to_vec()).chain(decoded);
                inner_container(rest, nested, file_name)
            }
        },
        Err(err) => {
            log::debug!("decompress {compression}: {err}, treating as csv");
            Container::Csv
        }
    }
}

/// Sniffs the first bytes of `r`. The returned reader yields the complete,
/// unconsumed original stream.
pub fn detect_reader_type<R: Read>(r: R, file_name: &str) -> io::Result<(FileType, Replay<R>)> {
    let mut replay = Replay::new(r);
    let (magic, n) = read_magic(&mut replay)?;
    let magic = &magic[..n];
    let typ = match compression_of(magic) {
        Compression::None => FileType {
            container: container_of(magic, file_name),
            compression: Compression::None,
        },
        compression => {
            let head = io::Cursor::new(magic.to_vec()).chain(&mut replay);
            FileType {
                container: inner_container(head, compression, file_name),
                compression,
            }
        }
    };
    replay.rewind();
    Ok((typ, replay))
}

/// Strips every compression layer of `r`.
pub fn decompress<'a, R: Read + 'a>(r: R) -> io::Result<Box<dyn Read + 'a>> {
    let mut replay = Replay::new(r);
    let (magic, n) = read_magic(&mut replay)?;
    replay.rewind();
    match compression_of(&magic[..n]) {
        Compression::None => Ok(Box::new(replay)),
        compression => decompress(decoder(replay, compression)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn detect(data: &[u8], name: &str) -> FileType {
        detect_reader_type(data, name).unwrap().0
    }

    #[test]
    fn plain_containers() {
        assert_eq!(detect(b"a;b\n1;2\n", "x").container, Container::Csv);
        assert_eq!(detect(&[0xd0, 0xcf, 0x11, 0xe0, 0], "x.xls").container, Container::Xls);
        assert_eq!(detect(b"PK\x03\x04rest", "x.xlsx").container, Container::Xlsx);
        assert_eq!(detect(b"PK\x03\x04rest", "x.ODS").container, Container::Ods);
        assert_eq!(detect(b"", "empty").container, Container::Csv);
    }

    #[test]
    fn replay_yields_whole_stream() {
        let data = b"id;str\n1;alma\n";
        let (_, mut r) = detect_reader_type(&data[..], "").unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn nested_compression() {
        let csv = b"id;str\n1;alma\n".to_vec();
        let inner = zstd::stream::encode_all(&csv[..], 0).unwrap();
        let outer = gzip(&inner);

        let (typ, mut r) = detect_reader_type(&outer[..], "x.csv.zst.gz").unwrap();
        assert_eq!(
            typ,
            FileType {
                container: Container::Csv,
                compression: Compression::Gzip
            }
        );
        let mut raw = Vec::new();
        r.read_to_end(&mut raw).unwrap();
        assert_eq!(raw, outer);

        let mut plain = Vec::new();
        decompress(&raw[..]).unwrap().read_to_end(&mut plain).unwrap();
        assert_eq!(plain, csv);
    }

    #[test]
    fn gzipped_spreadsheet() {
        let typ = detect(&gzip(b"PK\x03\x04 not really a zip"), "book.xlsx.gz");
        assert_eq!(typ.container, Container::Xlsx);
        assert_eq!(typ.to_string(), "xlsx+gzip");
    }

    #[test]
    fn broken_compression_is_csv() {
        let typ = detect(&[0x1f, 0x8b, 0xff, 0xff, 0xff], "junk");
        assert_eq!(
            typ,
            FileType {
                container: Container::Csv,
                compression: Compression::Gzip
            }
        );
    }
}
