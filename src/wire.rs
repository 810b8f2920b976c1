//! Framing shared by signature and patch files.
//!
//! Layout: 8-byte magic, an uncompressed header, then a body of bincode
//! records, zstd-compressed unless the header says otherwise.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, Read, Write};

use crate::error::{Error, Result};

pub const FORMAT_VERSION: u32 = 1;

/// Upper bound on a single encoded record; guards allocations on corrupt input.
pub const MAX_RECORD_LEN: u64 = 256 * 1024 * 1024;

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    #[default]
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl CompressionSettings {
    pub fn none() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            level: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    version: u32,
    compression: CompressionSettings,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_RECORD_LEN)
}

/// Serialize one record into the body.
pub fn write_record<W: Write, T: Serialize>(w: &mut W, value: &T, context: &str) -> Result<()> {
    codec().serialize_into(w, value).map_err(|e| match *e {
        bincode::ErrorKind::Io(io) => Error::io(context, io),
        other => Error::decode(context, other),
    })
}

/// Deserialize one record from the body. Any failure, including a
/// truncated stream, is a decode error: the envelope was already accepted.
pub fn read_record<R: Read, T: DeserializeOwned>(r: &mut R, context: &str) -> Result<T> {
    codec()
        .deserialize_from(r)
        .map_err(|e| Error::decode(context, e))
}

pub enum BodyWriter<W: Write> {
    Plain(W),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> BodyWriter<W> {
    /// Flush compressed state and hand back the underlying writer.
    pub fn finish(self) -> Result<W> {
        match self {
            BodyWriter::Plain(mut w) => {
                w.flush().map_err(|e| Error::io("flushing body", e))?;
                Ok(w)
            }
            BodyWriter::Zstd(enc) => {
                let mut w = enc.finish().map_err(|e| Error::io("finishing zstd stream", e))?;
                w.flush().map_err(|e| Error::io("flushing body", e))?;
                Ok(w)
            }
        }
    }
}

impl<W: Write> Write for BodyWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BodyWriter::Plain(w) => w.write(buf),
            BodyWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BodyWriter::Plain(w) => w.flush(),
            BodyWriter::Zstd(w) => w.flush(),
        }
    }
}

pub enum BodyReader<R: Read> {
    Plain(R),
    Zstd(zstd::Decoder<'static, BufReader<R>>),
}

impl<R: Read> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodyReader::Plain(r) => r.read(buf),
            BodyReader::Zstd(r) => r.read(buf),
        }
    }
}

/// Write magic and header, returning the writer for the body.
pub fn start_body<W: Write>(
    mut w: W,
    magic: &[u8; 8],
    compression: CompressionSettings,
) -> Result<BodyWriter<W>> {
    w.write_all(magic).map_err(|e| Error::io("writing magic", e))?;
    let header = Header {
        version: FORMAT_VERSION,
        compression,
    };
    write_record(&mut w, &header, "header")?;

    match compression.algorithm {
        CompressionAlgorithm::None => Ok(BodyWriter::Plain(w)),
        CompressionAlgorithm::Zstd => {
            let enc = zstd::Encoder::new(w, compression.level)
                .map_err(|e| Error::io("creating zstd encoder", e))?;
            Ok(BodyWriter::Zstd(enc))
        }
    }
}

/// Read fewer than `buf.len()` bytes only at end of stream.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Check the magic and header of a stream.
///
/// Returns `Ok(None)` when the stream is not this kind of file at all
/// (empty, too short, or wrong magic). A matching magic followed by a bad
/// header is a decode error.
pub fn open_body<R: Read>(
    mut r: R,
    magic: &[u8; 8],
    context: &str,
) -> Result<Option<(BodyReader<R>, CompressionSettings)>> {
    let mut found = [0u8; 8];
    let n = read_full(&mut r, &mut found).map_err(|e| Error::io(format!("reading {} magic", context), e))?;
    if n < found.len() || &found != magic {
        return Ok(None);
    }

    let header: Header = read_record(&mut r, context)?;
    if header.version != FORMAT_VERSION {
        return Err(Error::decode(
            context,
            format!(
                "unsupported format version {} (expected {})",
                header.version, FORMAT_VERSION
            ),
        ));
    }

    let body = match header.compression.algorithm {
        CompressionAlgorithm::None => BodyReader::Plain(r),
        CompressionAlgorithm::Zstd => BodyReader::Zstd(
            zstd::Decoder::new(r).map_err(|e| Error::io("creating zstd decoder", e))?,
        ),
    };
    Ok(Some((body, header.compression)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: &[u8; 8] = b"TESTMAG1";

    fn encode(compression: CompressionSettings, values: &[u64]) -> Vec<u8> {
        let mut body = start_body(Vec::new(), MAGIC, compression).unwrap();
        for v in values {
            write_record(&mut body, v, "test").unwrap();
        }
        body.finish().unwrap()
    }

    #[test]
    fn test_records_survive_both_compressions() {
        for compression in [CompressionSettings::none(), CompressionSettings::default()] {
            let bytes = encode(compression, &[1, 2, 3]);
            let (mut body, found) = open_body(&bytes[..], MAGIC, "test").unwrap().unwrap();
            assert_eq!(found, compression);
            let values: Vec<u64> = (0..3).map(|_| read_record(&mut body, "test").unwrap()).collect();
            assert_eq!(values, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_wrong_magic_and_empty_are_not_this_format() {
        assert!(open_body(&b""[..], MAGIC, "test").unwrap().is_none());
        assert!(open_body(&b"TEST"[..], MAGIC, "test").unwrap().is_none());
        assert!(open_body(&b"SOMETHING ELSE ENTIRELY"[..], MAGIC, "test").unwrap().is_none());
    }

    #[test]
    fn test_truncated_header_is_decode_error() {
        let bytes = encode(CompressionSettings::none(), &[]);
        let err = open_body(&bytes[..MAGIC.len() + 2], MAGIC, "test").err().unwrap();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_truncated_record_is_decode_error() {
        let bytes = encode(CompressionSettings::none(), &[42]);
        let (mut body, _) = open_body(&bytes[..bytes.len() - 3], MAGIC, "test").unwrap().unwrap();
        let err = read_record::<_, u64>(&mut body, "test").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }
}
