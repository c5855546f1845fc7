//! 提交帧负载压缩/解压（LZ4 / None）

use crate::common::{MappingError, Result};

/// 提交帧负载的压缩方式，以单字节写入帧头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Lz4,
}

impl CompressionType {
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4  => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            other => Err(MappingError::Compression(format!("unknown codec {other}"))),
        }
    }
}

pub fn compress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| MappingError::Compression(e.to_string())),
    }
}

pub fn decompress(
    data:             &[u8],
    codec:            CompressionType,
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  => {
            if uncompressed_len == 0 {
                return Ok(Vec::new());
            }
            let len = i32::try_from(uncompressed_len).map_err(|_| {
                MappingError::Compression(format!("uncompressed length {uncompressed_len} too large"))
            })?;
            lz4::block::decompress(data, Some(len))
                .map_err(|e| MappingError::Compression(e.to_string()))
        }
    }
}
