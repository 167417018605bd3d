//! # Compression stage
//!
//! Streaming zstd / xz codecs used by the optional compress and decompress
//! stages of a job. Both directions implement [`Transform`], so they run in
//! the same chunk loop as the ciphers and honour pause and cancellation
//! between chunks.
//!
//! The decompressor does not trust the file name: it picks the codec from
//! the stream's magic bytes.

use std::io::Write;

use serde::{Deserialize, Serialize};
use xz2::stream::{Check, Stream};
use xz2::write::{XzDecoder, XzEncoder};
use zstd::stream::raw::{Decoder as RawZstdDecoder, InBuffer, Operation, OutBuffer};

use crate::error::{ConfigError, TransformError};
use crate::stream::Transform;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const DECODE_BUFFER: usize = 256 * 1024; // 256 KiB

/// Compression codec and level used by the compress stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum Codec {
    /// Zstandard. Fast and effective.
    Zstd { level: i32 },
    /// LZMA2 in an .xz container, preset 0-9.
    Xz { preset: u32 },
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Zstd { level: 3 }
    }
}

impl Codec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Codec::Zstd { level } => {
                let range = zstd::compression_level_range();
                if range.contains(&level) {
                    Ok(())
                } else {
                    Err(ConfigError::InvalidValue {
                        field: "codec.level",
                        reason: format!(
                            "zstd level {level} outside {}..={}",
                            range.start(),
                            range.end()
                        ),
                    })
                }
            }
            Codec::Xz { preset } if preset > 9 => Err(ConfigError::InvalidValue {
                field: "codec.preset",
                reason: format!("xz preset {preset} outside 0..=9"),
            }),
            Codec::Xz { .. } => Ok(()),
        }
    }

    /// Extension appended to the compressed intermediate, dot included.
    pub fn suffix(&self) -> &'static str {
        match self {
            Codec::Zstd { .. } => ".zst",
            Codec::Xz { .. } => ".xz",
        }
    }

    /// Codec whose suffix ends `name`, if any.
    pub fn from_suffix(name: &str) -> Option<Codec> {
        let lower = name.to_ascii_lowercase();
        [Codec::default(), Codec::Xz { preset: 6 }]
            .into_iter()
            .find(|codec| lower.len() > codec.suffix().len() && lower.ends_with(codec.suffix()))
    }

    /// Parses a command line codec name (`zstd`, `zst`, `xz`, `lzma2`).
    pub fn from_name(name: &str, level: Option<i32>) -> Option<Codec> {
        match name.to_ascii_lowercase().as_str() {
            "zstd" | "zst" => Some(Codec::Zstd {
                level: level.unwrap_or(3),
            }),
            "xz" | "lzma2" => Some(Codec::Xz {
                preset: level.map(|l| l.clamp(0, 9) as u32).unwrap_or(6),
            }),
            _ => None,
        }
    }
}

fn codec_err(e: std::io::Error) -> TransformError {
    TransformError::Codec(e.to_string())
}

fn corrupt(e: std::io::Error) -> TransformError {
    TransformError::Corrupt(e.to_string())
}

enum Encoder {
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
    Xz(XzEncoder<Vec<u8>>),
}

/// Compressing transform.
pub struct Compressor {
    encoder: Option<Encoder>,
}

impl Compressor {
    pub fn new(codec: Codec) -> Result<Self, TransformError> {
        let encoder = match codec {
            Codec::Zstd { level } => {
                let mut encoder =
                    zstd::stream::write::Encoder::new(Vec::new(), level).map_err(codec_err)?;
                encoder.include_checksum(true).map_err(codec_err)?;
                Encoder::Zstd(encoder)
            }
            Codec::Xz { preset } => {
                let stream = Stream::new_easy_encoder(preset, Check::Crc64)
                    .map_err(|e| TransformError::Codec(e.to_string()))?;
                Encoder::Xz(XzEncoder::new_stream(Vec::new(), stream))
            }
        };
        Ok(Self {
            encoder: Some(encoder),
        })
    }
}

impl Transform for Compressor {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), TransformError> {
        let buffered = match self.encoder.as_mut() {
            Some(Encoder::Zstd(enc)) => {
                enc.write_all(input).map_err(codec_err)?;
                enc.get_mut()
            }
            Some(Encoder::Xz(enc)) => {
                enc.write_all(input).map_err(codec_err)?;
                enc.get_mut()
            }
            None => return Err(TransformError::Codec("encoder already finished".to_string())),
        };
        out.append(buffered);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), TransformError> {
        let mut tail = match self.encoder.take() {
            Some(Encoder::Zstd(enc)) => enc.finish().map_err(codec_err)?,
            Some(Encoder::Xz(enc)) => enc.finish().map_err(codec_err)?,
            None => return Ok(()),
        };
        out.append(&mut tail);
        Ok(())
    }
}

struct ZstdFrames {
    raw: RawZstdDecoder<'static>,
    buf: Vec<u8>,
    /// True between frames; a stream ending mid-frame is truncated.
    at_boundary: bool,
}

impl ZstdFrames {
    fn new() -> Result<Self, TransformError> {
        Ok(Self {
            raw: RawZstdDecoder::new().map_err(codec_err)?,
            buf: vec![0u8; DECODE_BUFFER],
            at_boundary: true,
        })
    }

    fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), TransformError> {
        let mut input = InBuffer::around(data);
        loop {
            let before = input.pos();
            let (hint, written) = {
                let mut output = OutBuffer::around(&mut self.buf[..]);
                let hint = self.raw.run(&mut input, &mut output).map_err(corrupt)?;
                (hint, output.pos())
            };
            out.extend_from_slice(&self.buf[..written]);
            if hint == 0 {
                self.at_boundary = true;
            } else if written > 0 || input.pos() > before {
                self.at_boundary = false;
            }
            if input.pos() >= data.len() && written < self.buf.len() {
                return Ok(());
            }
        }
    }
}

enum Decoder {
    Zstd(ZstdFrames),
    Xz(XzDecoder<Vec<u8>>),
}

/// Decompressing transform; detects zstd or xz from the leading magic bytes.
pub struct Decompressor {
    head: Vec<u8>,
    decoder: Option<Decoder>,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    pub fn new() -> Self {
        Self {
            head: Vec::with_capacity(XZ_MAGIC.len()),
            decoder: None,
        }
    }

    /// Picks the decoder once enough bytes are known. `Ok(None)` means "need more".
    fn detect(head: &[u8]) -> Result<Option<Decoder>, TransformError> {
        if head.len() >= ZSTD_MAGIC.len() && head.starts_with(&ZSTD_MAGIC) {
            return ZstdFrames::new().map(|frames| Some(Decoder::Zstd(frames)));
        }
        if head.len() >= XZ_MAGIC.len() {
            if head.starts_with(&XZ_MAGIC) {
                return Ok(Some(Decoder::Xz(XzDecoder::new(Vec::new()))));
            }
            return Err(TransformError::Format(
                "not a zstd or xz stream".to_string(),
            ));
        }
        Ok(None)
    }

    fn feed(decoder: &mut Decoder, data: &[u8], out: &mut Vec<u8>) -> Result<(), TransformError> {
        match decoder {
            Decoder::Zstd(frames) => frames.feed(data, out),
            Decoder::Xz(dec) => {
                dec.write_all(data).map_err(corrupt)?;
                out.append(dec.get_mut());
                Ok(())
            }
        }
    }
}

impl Transform for Decompressor {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), TransformError> {
        if let Some(decoder) = self.decoder.as_mut() {
            return Self::feed(decoder, input, out);
        }

        self.head.extend_from_slice(input);
        let Some(mut decoder) = Self::detect(&self.head)? else {
            return Ok(());
        };
        let head = std::mem::take(&mut self.head);
        Self::feed(&mut decoder, &head, out)?;
        self.decoder = Some(decoder);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), TransformError> {
        match self.decoder.take() {
            None => Err(TransformError::Format(
                "stream too short to be compressed data".to_string(),
            )),
            Some(Decoder::Zstd(mut frames)) => {
                frames.feed(&[], out)?;
                if frames.at_boundary {
                    Ok(())
                } else {
                    Err(TransformError::Corrupt("truncated zstd frame".to_string()))
                }
            }
            Some(Decoder::Xz(mut dec)) => {
                let mut tail = dec.finish().map_err(corrupt)?;
                out.append(&mut tail);
                Ok(())
            }
        }
    }
}
