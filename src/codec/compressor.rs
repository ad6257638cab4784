// src/codec/compressor.rs

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{ExchangeError, ExchangeResult};

/// 压缩算法版本
///
/// 版本号会写进载荷帧头的 meta 字节，收端据此选择解压器。
/// Gzip 的版本号沿用竞价服务端约定的 2。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressorVersion {
    Identity,
    Gzip,
}

impl CompressorVersion {
    pub const IDENTITY: u8 = 0;
    pub const GZIP: u8 = 2;

    pub fn version(&self) -> u8 {
        match self {
            Self::Identity => Self::IDENTITY,
            Self::Gzip => Self::GZIP,
        }
    }

    pub fn from_version(version: u8) -> ExchangeResult<Self> {
        match version {
            Self::IDENTITY => Ok(Self::Identity),
            Self::GZIP => Ok(Self::Gzip),
            other => Err(ExchangeError::invalid_argument(format!(
                "unknown compressor version: {other}"
            ))),
        }
    }
}

/// 压缩产物，携带生成它的算法版本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedData {
    pub version: CompressorVersion,
    pub data: Vec<u8>,
}

/// 压缩一段字节
pub fn compress(data: &[u8], version: CompressorVersion) -> ExchangeResult<CompressedData> {
    let compressed = match version {
        CompressorVersion::Identity => data.to_vec(),
        CompressorVersion::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| ExchangeError::internal(format!("gzip compression failed: {e}")))?
        }
    };
    Ok(CompressedData {
        version,
        data: compressed,
    })
}

/// 解压，必须与压缩时的版本一致（由帧头恢复）
pub fn decompress(compressed: &CompressedData) -> ExchangeResult<Vec<u8>> {
    match compressed.version {
        CompressorVersion::Identity => Ok(compressed.data.clone()),
        CompressorVersion::Gzip => {
            let mut decoder = GzDecoder::new(compressed.data.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ExchangeError::invalid_argument(format!("gzip decompression failed: {e}")))?;
            Ok(out)
        }
    }
}
