use std::io::{Cursor, Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::crypto::Crypter;
use crate::error::{PgVaultError, Result};

/// Stream codec, selected by object-key suffix. `.lz4` is the current
/// format; `.lzo` is a legacy decode-only format behind the `lzo` feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Lz4,
    Lzo,
}

impl Codec {
    /// Resolve the codec from an object key. Unknown suffixes are a typed
    /// error; the fetch controllers treat it as fatal.
    pub fn for_key(key: &str) -> Result<Codec> {
        match key.rsplit('.').next() {
            Some("lz4") => Ok(Codec::Lz4),
            Some("lzo") => Ok(Codec::Lzo),
            _ => Err(PgVaultError::UnsupportedFileType(key.to_string())),
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Codec::Lz4 => "lz4",
            Codec::Lzo => "lzo",
        }
    }
}

/// Compress a whole buffer. Only the current codec can write.
pub fn compress(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::Lz4 => {
            let mut encoder = FrameEncoder::new(Vec::new());
            encoder.write_all(data)?;
            encoder
                .finish()
                .map_err(|e| PgVaultError::Other(format!("lz4 encode: {e}")))
        }
        Codec::Lzo => Err(PgVaultError::UnsupportedFileType(
            "lzo is legacy and decode-only".into(),
        )),
    }
}

/// Decompress a whole buffer.
pub fn decompress(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::Lz4 => {
            let mut out = Vec::new();
            FrameDecoder::new(Cursor::new(data))
                .read_to_end(&mut out)
                .map_err(|e| PgVaultError::Corrupt(format!("lz4 decode: {e}")))?;
            Ok(out)
        }
        Codec::Lzo => decompress_lzo(data),
    }
}

/// Streaming decoder over an owned compressed buffer, for feeding a tar
/// demultiplexer without materializing the decompressed part.
pub fn decode_reader(codec: Codec, data: Vec<u8>) -> Result<Box<dyn Read + Send>> {
    match codec {
        Codec::Lz4 => Ok(Box::new(FrameDecoder::new(Cursor::new(data)))),
        Codec::Lzo => Ok(Box::new(Cursor::new(decompress_lzo(&data)?))),
    }
}

/// Compress-then-encrypt, the upload-side composition.
pub fn seal(codec: Codec, crypter: &dyn Crypter, data: &[u8]) -> Result<Vec<u8>> {
    crypter.encrypt(compress(codec, data)?)
}

/// Decrypt-then-decompress, the download-side composition.
pub fn open(codec: Codec, crypter: &dyn Crypter, data: Vec<u8>) -> Result<Vec<u8>> {
    decompress(codec, &crypter.decrypt(data)?)
}

/// Decrypt and hand back a streaming decoder.
pub fn open_reader(
    codec: Codec,
    crypter: &dyn Crypter,
    data: Vec<u8>,
) -> Result<Box<dyn Read + Send>> {
    decode_reader(codec, crypter.decrypt(data)?)
}

#[cfg(feature = "lzo")]
fn decompress_lzo(data: &[u8]) -> Result<Vec<u8>> {
    // Legacy segments are exactly one WAL segment long when decompressed.
    let lzo = minilzo_rs::LZO::init()
        .map_err(|e| PgVaultError::Other(format!("lzo init: {e:?}")))?;
    lzo.decompress_safe(data, crate::wal::WAL_SEGMENT_SIZE as usize)
        .map_err(|e| PgVaultError::Corrupt(format!("lzo decode: {e:?}")))
}

#[cfg(not(feature = "lzo"))]
fn decompress_lzo(_data: &[u8]) -> Result<Vec<u8>> {
    Err(PgVaultError::UnsupportedFileType(
        "lzo (compile with feature 'lzo')".into(),
    ))
}
