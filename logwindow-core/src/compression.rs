use std::fmt;
use std::io::Write;
use std::str::FromStr;

use bytes::Bytes;
use flate2::Compression as FlateLevel;
use flate2::GzBuilder;
use flate2::write::ZlibEncoder;

use crate::Error;
use crate::Result;

/// Codec applied to a batch before it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Codec {
    Gzip,
    Bzip2,
    /// DEFLATE in a zlib container.
    Deflate,
    Uncompressed,
}

impl Codec {
    pub(crate) fn extension(&self) -> &'static str {
        match self {
            Codec::Gzip => "gz",
            Codec::Bzip2 => "bz2",
            Codec::Deflate => "zlib",
            Codec::Uncompressed => "json",
        }
    }

    pub(crate) fn content_type(&self) -> &'static str {
        match self {
            Codec::Gzip => "application/gzip",
            Codec::Bzip2 => "application/x-bzip2",
            Codec::Deflate => "application/zlib",
            Codec::Uncompressed => "application/json",
        }
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(Codec::Gzip),
            "bzip2" | "bz2" => Ok(Codec::Bzip2),
            "deflate" | "zlib" => Ok(Codec::Deflate),
            "uncompressed" | "none" => Ok(Codec::Uncompressed),
            other => Err(Error::Config(format!(
                "unknown compression codec {other:?}, expected one of gzip, bzip2, deflate, uncompressed"
            ))),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Gzip => write!(f, "gzip"),
            Codec::Bzip2 => write!(f, "bzip2"),
            Codec::Deflate => write!(f, "deflate"),
            Codec::Uncompressed => write!(f, "uncompressed"),
        }
    }
}

/// Serializes the payloads newline-delimited, in the given order, and compresses them. The output
/// is a pure function of its input: the gzip header carries no timestamp or file name.
pub(crate) fn compress<'a>(
    payloads: impl IntoIterator<Item = &'a Bytes>,
    codec: Codec,
) -> Result<Bytes> {
    match codec {
        Codec::Gzip => {
            let encoder = GzBuilder::new()
                .mtime(0)
                .write(Vec::new(), FlateLevel::default());
            encode(encoder, payloads, |e| e.finish(), codec)
        }
        Codec::Deflate => {
            let encoder = ZlibEncoder::new(Vec::new(), FlateLevel::default());
            encode(encoder, payloads, |e| e.finish(), codec)
        }
        Codec::Bzip2 => {
            let encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encode(encoder, payloads, |e| e.finish(), codec)
        }
        Codec::Uncompressed => {
            let mut out = Vec::new();
            for payload in payloads {
                out.extend_from_slice(payload);
                out.push(b'\n');
            }
            Ok(Bytes::from(out))
        }
    }
}

fn encode<'a, W: Write>(
    mut encoder: W,
    payloads: impl IntoIterator<Item = &'a Bytes>,
    finish: impl FnOnce(W) -> std::io::Result<Vec<u8>>,
    codec: Codec,
) -> Result<Bytes> {
    for payload in payloads {
        encoder
            .write_all(payload)
            .and_then(|_| encoder.write_all(b"\n"))
            .map_err(|e| Error::Compression(format!("{codec} write: {e}")))?;
    }
    finish(encoder)
        .map(Bytes::from)
        .map_err(|e| Error::Compression(format!("{codec} finish: {e}")))
}

/// Inverse of [compress], returning the newline-delimited payload stream.
#[cfg(test)]
pub(crate) fn decompress(data: &[u8], codec: Codec) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut out = Vec::new();
    let result = match codec {
        Codec::Gzip => flate2::read::GzDecoder::new(data).read_to_end(&mut out),
        Codec::Deflate => flate2::read::ZlibDecoder::new(data).read_to_end(&mut out),
        Codec::Bzip2 => bzip2::read::BzDecoder::new(data).read_to_end(&mut out),
        Codec::Uncompressed => {
            out.extend_from_slice(data);
            Ok(data.len())
        }
    };
    result.map_err(|e| Error::Compression(format!("{codec} decode: {e}")))?;
    Ok(out)
}
