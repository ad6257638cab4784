// src/codec/formatter.rs
//
// 载荷封装帧格式：
//
//   [meta 1B][payload 长度 4B 大端][payload][0 填充]
//
// meta 字节高 3 位是封装器版本，低 5 位是压缩器版本，收端只凭缓冲区
// 本身即可恢复两个版本和原始边界。

use once_cell::sync::Lazy;

use crate::codec::compressor::{CompressedData, CompressorVersion};
use crate::error::{ExchangeError, ExchangeResult};

pub const META_INFO_LENGTH_BYTES: usize = 1;
pub const DATA_SIZE_LENGTH_BYTES: usize = 4;

const FORMATTER_VERSION_SHIFT: u8 = 5;
const COMPRESSOR_VERSION_MASK: u8 = 0b0001_1111;

/// 默认桶表（字节）：取不小于所需长度的最小桶
pub static DEFAULT_BUCKET_SIZES: Lazy<Vec<usize>> =
    Lazy::new(|| vec![0, 1024, 2048, 4096, 8192, 16384, 32768, 65536]);

/// 封装器版本
///
/// - `V0`：按桶取整，带宽观测只能看到离散的几档体积
/// - `ExactSize`：固定输出到一个精确体积，供调用方做确定性带宽预算
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatterVersion {
    V0 { bucket_sizes: Vec<usize> },
    ExactSize { target_bytes: usize },
}

impl FormatterVersion {
    pub const VERSION_V0: u8 = 0;
    pub const VERSION_EXACT_SIZE: u8 = 1;

    pub fn version(&self) -> u8 {
        match self {
            Self::V0 { .. } => Self::VERSION_V0,
            Self::ExactSize { .. } => Self::VERSION_EXACT_SIZE,
        }
    }

    pub fn v0_default() -> Self {
        Self::V0 {
            bucket_sizes: DEFAULT_BUCKET_SIZES.clone(),
        }
    }
}

/// 待封装数据（压缩产物的字节）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnformattedData {
    pub data: Vec<u8>,
}

/// 封装产物；长度已经按版本策略固定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedData {
    pub data: Vec<u8>,
}

fn meta_byte(formatter_version: u8, compressor_version: u8) -> u8 {
    (formatter_version << FORMATTER_VERSION_SHIFT) | (compressor_version & COMPRESSOR_VERSION_MASK)
}

pub fn extract_formatter_version(meta: u8) -> u8 {
    meta >> FORMATTER_VERSION_SHIFT
}

pub fn extract_compressor_version(meta: u8) -> u8 {
    meta & COMPRESSOR_VERSION_MASK
}

/// 封装：写 meta/长度头，再按版本策略补零到目标体积
pub fn format(
    unformatted: &UnformattedData,
    formatter: &FormatterVersion,
    compressor_version: CompressorVersion,
) -> ExchangeResult<FormattedData> {
    let needed = META_INFO_LENGTH_BYTES + DATA_SIZE_LENGTH_BYTES + unformatted.data.len();
    let total = match formatter {
        FormatterVersion::V0 { bucket_sizes } => {
            *bucket_sizes
                .iter()
                .find(|&&bucket| bucket >= needed)
                .ok_or_else(|| {
                    ExchangeError::invalid_argument(format!(
                        "payload of {needed} bytes exceeds the largest bucket ({} bytes)",
                        bucket_sizes.last().copied().unwrap_or(0)
                    ))
                })?
        }
        FormatterVersion::ExactSize { target_bytes } => {
            if needed > *target_bytes {
                return Err(ExchangeError::invalid_argument(format!(
                    "payload of {needed} bytes exceeds the exact-size target ({target_bytes} bytes)"
                )));
            }
            *target_bytes
        }
    };

    let mut framed = Vec::with_capacity(total);
    framed.push(meta_byte(formatter.version(), compressor_version.version()));
    framed.extend_from_slice(&(unformatted.data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&unformatted.data);
    framed.resize(total, 0);
    Ok(FormattedData { data: framed })
}

/// 解封装：从缓冲区自身恢复版本与原始边界
///
/// 返回去掉填充的数据以及压缩器版本（已按 meta 字节还原）。
pub fn unformat(formatted: &FormattedData) -> ExchangeResult<(UnformattedData, CompressedData)> {
    let buf = &formatted.data;
    if buf.len() < META_INFO_LENGTH_BYTES + DATA_SIZE_LENGTH_BYTES {
        return Err(ExchangeError::invalid_argument(
            "formatted payload is shorter than its header".to_string(),
        ));
    }

    let meta = buf[0];
    let formatter_version = extract_formatter_version(meta);
    if formatter_version != FormatterVersion::VERSION_V0
        && formatter_version != FormatterVersion::VERSION_EXACT_SIZE
    {
        return Err(ExchangeError::invalid_argument(format!(
            "unknown payload formatter version: {formatter_version}"
        )));
    }
    let compressor = CompressorVersion::from_version(extract_compressor_version(meta))?;

    let mut size_bytes = [0u8; DATA_SIZE_LENGTH_BYTES];
    size_bytes.copy_from_slice(&buf[META_INFO_LENGTH_BYTES..META_INFO_LENGTH_BYTES + DATA_SIZE_LENGTH_BYTES]);
    let declared = u32::from_be_bytes(size_bytes) as usize;

    let start = META_INFO_LENGTH_BYTES + DATA_SIZE_LENGTH_BYTES;
    let end = start
        .checked_add(declared)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| {
            ExchangeError::invalid_argument(format!(
                "declared payload length {declared} overruns the {} byte buffer",
                buf.len()
            ))
        })?;

    let data = buf[start..end].to_vec();
    Ok((
        UnformattedData { data: data.clone() },
        CompressedData {
            version: compressor,
            data,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::compressor::{self, CompressorVersion};
    use proptest::prelude::*;

    #[test]
    fn v0_rounds_up_to_smallest_sufficient_bucket() {
        let formatter = FormatterVersion::v0_default();
        let unformatted = UnformattedData {
            data: vec![7u8; 1000],
        };
        // 1000 + 5 字节头 → 2048 桶
        let formatted = format(&unformatted, &formatter, CompressorVersion::Gzip).unwrap();
        assert_eq!(formatted.data.len(), 2048);

        let (recovered, compressed) = unformat(&formatted).unwrap();
        assert_eq!(recovered.data, unformatted.data);
        assert_eq!(compressed.version, CompressorVersion::Gzip);
    }

    #[test]
    fn v0_fails_past_the_largest_bucket() {
        let formatter = FormatterVersion::v0_default();
        let unformatted = UnformattedData {
            data: vec![0u8; 70_000],
        };
        assert!(matches!(
            format(&unformatted, &formatter, CompressorVersion::Gzip),
            Err(ExchangeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn exact_size_emits_exactly_the_target() {
        let formatter = FormatterVersion::ExactSize { target_bytes: 4096 };
        let formatted = format(
            &UnformattedData { data: vec![1u8; 64] },
            &formatter,
            CompressorVersion::Identity,
        )
        .unwrap();
        assert_eq!(formatted.data.len(), 4096);

        let (recovered, _) = unformat(&formatted).unwrap();
        assert_eq!(recovered.data, vec![1u8; 64]);
    }

    #[test]
    fn exact_size_rejects_oversized_payloads() {
        let formatter = FormatterVersion::ExactSize { target_bytes: 32 };
        assert!(format(
            &UnformattedData { data: vec![0u8; 64] },
            &formatter,
            CompressorVersion::Identity,
        )
        .is_err());
    }

    #[test]
    fn meta_byte_packs_both_versions() {
        let meta = meta_byte(FormatterVersion::VERSION_EXACT_SIZE, CompressorVersion::GZIP);
        assert_eq!(extract_formatter_version(meta), FormatterVersion::VERSION_EXACT_SIZE);
        assert_eq!(extract_compressor_version(meta), CompressorVersion::GZIP);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        assert!(unformat(&FormattedData { data: vec![0u8; 3] }).is_err());
        // 声明长度超出缓冲区
        let mut bogus = vec![meta_byte(0, CompressorVersion::IDENTITY)];
        bogus.extend_from_slice(&1024u32.to_be_bytes());
        bogus.extend_from_slice(&[0u8; 8]);
        assert!(unformat(&FormattedData { data: bogus }).is_err());
    }

    proptest! {
        // 往返律：unformat(format(compress(b))) == compress(b)，且再解压得到 b
        #[test]
        fn compress_format_round_trip(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            gzip in any::<bool>(),
            exact in any::<bool>(),
        ) {
            let compressor = if gzip { CompressorVersion::Gzip } else { CompressorVersion::Identity };
            let formatter = if exact {
                FormatterVersion::ExactSize { target_bytes: 16384 }
            } else {
                FormatterVersion::v0_default()
            };

            let compressed = compressor::compress(&data, compressor).unwrap();
            let formatted = format(
                &UnformattedData { data: compressed.data.clone() },
                &formatter,
                compressor,
            ).unwrap();

            let (unformatted, recovered) = unformat(&formatted).unwrap();
            prop_assert_eq!(unformatted.data, compressed.data.clone());
            prop_assert_eq!(recovered.version, compressor);
            prop_assert_eq!(compressor::decompress(&recovered).unwrap(), data);
        }
    }
}
