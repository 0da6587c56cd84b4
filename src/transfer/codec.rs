//! Stream decompression shared by the archive extractor and compressed API payloads.

use std::io::{self, Read};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Zlib,
    /// Raw deflate without framing.
    Deflate,
}

impl Codec {
    /// Guess the framing from the first bytes of a payload.
    pub fn sniff(bytes: &[u8]) -> Option<Codec> {
        match bytes {
            [0x1f, 0x8b, ..] => Some(Codec::Gzip),
            [cmf, flg, ..] if cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0 => {
                Some(Codec::Zlib)
            }
            _ => None,
        }
    }

    pub fn decoder<'a, R: Read + 'a>(self, reader: R) -> Box<dyn Read + 'a> {
        match self {
            Codec::Gzip => Box::new(GzDecoder::new(reader)),
            Codec::Zlib => Box::new(ZlibDecoder::new(reader)),
            Codec::Deflate => Box::new(DeflateDecoder::new(reader)),
        }
    }
}

pub fn decompress<R: Read>(codec: Codec, reader: R) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    codec.decoder(reader).read_to_end(&mut out)?;
    Ok(out)
}

/// Inflate a payload of unknown framing, falling back to raw deflate.
pub fn inflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let codec = Codec::sniff(bytes).unwrap_or(Codec::Deflate);
    decompress(codec, bytes)
}
