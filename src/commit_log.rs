//! 提交日志（commit log）文件读写
//!
//! 文件格式：
//! ```text
//! ┌────────────────────────────────────┐
//! │  MAGIC  (8 bytes) "EXTRSLOG"       │
//! │  Version(4 bytes) = 2              │
//! ├────────────────────────────────────┤
//! │  COMMIT FRAME 0                    │ ← 一个已提交事务
//! │    payload_len  (u32 LE)           │
//! │    raw_len      (u32 LE)           │
//! │    codec        (u8)               │
//! │    entry_count  (u32 LE)           │
//! │    CRC32        (u32 LE, payload)  │
//! │    CRC32        (u32 LE, 以上字段) │
//! │    payload      (LZ4 / None)       │
//! ├────────────────────────────────────┤
//! │  COMMIT FRAME 1 ...                │
//! └────────────────────────────────────┘
//! ```
//!
//! 解压后的 payload 为 `entry_count × (key_len u32 | key | value_len u32 | value)`。
//! 帧按提交顺序追加；重放时依次应用，后写覆盖先写。
//!
//! 帧头自带 CRC：长度字段先校验再使用。只有校验通过、且帧尾越过文件末尾的帧
//! 才算半截帧。

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{error, info, warn};

use crate::common::{MappingError, Result};
use crate::compression::{self, CompressionType};
use crate::config::MAX_TXN_BYTES_LIMIT;

pub const LOG_FILE_NAME: &str = "mapping.log";

const MAGIC: &[u8; 8]         = b"EXTRSLOG";
const VERSION: u32            = 2;
const FILE_HEADER_LEN: u64    = 12;
/// 帧头中参与 header CRC 的字段长度
const FRAME_FIELDS_LEN: usize = 17;
const FRAME_HEADER_LEN: usize = FRAME_FIELDS_LEN + 4;
/// payload 中每个条目的长度前缀开销
const ENTRY_PREFIX_LEN: usize = 8;

/// 一条 (key, value)
pub type Entry = (Vec<u8>, Vec<u8>);

// ── 帧编解码 ──────────────────────────────────────────────────────────────────

fn encode_payload(entries: &[Entry]) -> Result<Vec<u8>> {
    let size = entries.iter().map(|(k, v)| ENTRY_PREFIX_LEN + k.len() + v.len()).sum();
    let mut out = Vec::with_capacity(size);
    for (k, v) in entries {
        out.write_u32::<LittleEndian>(len_u32(k.len())?)?;
        out.write_all(k)?;
        out.write_u32::<LittleEndian>(len_u32(v.len())?)?;
        out.write_all(v)?;
    }
    Ok(out)
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| MappingError::Commit(format!("length {len} does not fit a commit frame")))
}

fn decode_payload(mut raw: &[u8], count: u32, offset: u64) -> Result<Vec<Entry>> {
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key   = read_chunk(&mut raw, offset)?;
        let value = read_chunk(&mut raw, offset)?;
        entries.push((key, value));
    }
    if !raw.is_empty() {
        return Err(MappingError::ChecksumMismatch { offset });
    }
    Ok(entries)
}

fn read_chunk(raw: &mut &[u8], offset: u64) -> Result<Vec<u8>> {
    let len = raw.read_u32::<LittleEndian>()
        .map_err(|_| MappingError::ChecksumMismatch { offset })? as usize;
    if raw.len() < len {
        return Err(MappingError::ChecksumMismatch { offset });
    }
    let cur: &[u8] = *raw;
    let (chunk, rest) = cur.split_at(len);
    *raw = rest;
    Ok(chunk.to_vec())
}

/// 将一批条目序列化为完整的提交帧（帧头 + payload）
fn build_frame(entries: &[Entry], codec: CompressionType) -> Result<Vec<u8>> {
    let raw = encode_payload(entries)?;
    if raw.len() > MAX_TXN_BYTES_LIMIT {
        return Err(MappingError::Commit(format!(
            "commit frame of {} bytes exceeds the {MAX_TXN_BYTES_LIMIT} byte limit", raw.len()
        )));
    }
    let payload = compression::compress(&raw, codec)?;
    let crc     = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.write_u32::<LittleEndian>(len_u32(payload.len())?)?;
    frame.write_u32::<LittleEndian>(len_u32(raw.len())?)?;
    frame.write_u8(codec.code())?;
    frame.write_u32::<LittleEndian>(len_u32(entries.len())?)?;
    frame.write_u32::<LittleEndian>(crc)?;
    let header_crc = crc32fast::hash(&frame[..FRAME_FIELDS_LEN]);
    frame.write_u32::<LittleEndian>(header_crc)?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// 读满 buf 或遇到 EOF，返回实际读到的字节数
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0)  => break,
            Ok(n)  => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

enum FrameRead {
    Frame(Vec<Entry>, u64),
    Eof,
    /// 文件尾部的半截帧（提交过程中崩溃）
    Torn,
}

/// 读取 `offset` 处的一帧；`file_len` 为日志文件总长
fn read_frame(reader: &mut impl Read, offset: u64, file_len: u64) -> Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_full(reader, &mut header)? {
        0 => return Ok(FrameRead::Eof),
        // 读不满帧头只可能是到了文件末尾
        n if n < FRAME_HEADER_LEN => return Ok(FrameRead::Torn),
        _ => {}
    }

    let (fields, mut tail) = header.split_at(FRAME_FIELDS_LEN);
    let header_crc = tail.read_u32::<LittleEndian>()?;
    if crc32fast::hash(fields) != header_crc {
        return Err(MappingError::ChecksumMismatch { offset });
    }

    let mut h = fields;
    let payload_len = h.read_u32::<LittleEndian>()? as usize;
    let raw_len     = h.read_u32::<LittleEndian>()? as usize;
    let codec_code  = h.read_u8()?;
    let count       = h.read_u32::<LittleEndian>()?;
    let stored_crc  = h.read_u32::<LittleEndian>()?;

    let frame_len = (FRAME_HEADER_LEN + payload_len) as u64;
    if offset + frame_len > file_len {
        return Ok(FrameRead::Torn);
    }

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload)?;
    if crc32fast::hash(&payload) != stored_crc {
        return Err(MappingError::ChecksumMismatch { offset });
    }

    let codec   = CompressionType::from_code(codec_code)?;
    let raw     = compression::decompress(&payload, codec, raw_len)?;
    let entries = decode_payload(&raw, count, offset)?;
    Ok(FrameRead::Frame(entries, frame_len))
}

fn write_file_header(file: &mut File) -> Result<()> {
    file.write_all(MAGIC)?;
    file.write_u32::<LittleEndian>(VERSION)?;
    Ok(())
}

// ── CommitLog ─────────────────────────────────────────────────────────────────

/// 追加写的提交日志，一帧对应一次 commit
pub struct CommitLog {
    path:   PathBuf,
    file:   File,
    size:   u64,
    frames: u64,
    /// 回退失败后文件尾部状态未知，拒绝继续追加
    broken: Option<String>,
}

impl CommitLog {
    /// 打开（或创建）日志并按序重放所有完整帧
    ///
    /// 尾部半截帧会被截断丢弃；帧头或 payload 的 CRC 不符视为损坏，返回错误。
    pub fn open(path: &Path, mut apply: impl FnMut(Vec<Entry>)) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len < FILE_HEADER_LEN {
            // 新文件，或创建时写了一半的文件头
            file.set_len(0)?;
            write_file_header(&mut file)?;
            file.sync_all()?;
            return Ok(Self {
                path: path.into(), file, size: FILE_HEADER_LEN, frames: 0, broken: None,
            });
        }

        let mut reader = BufReader::new(&mut file);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(MappingError::open(path, "invalid commit log magic"));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(MappingError::open(path, format!("unsupported log version {version}")));
        }

        let mut offset = FILE_HEADER_LEN;
        let mut frames = 0u64;
        let mut torn   = false;
        loop {
            match read_frame(&mut reader, offset, len)? {
                FrameRead::Frame(entries, frame_len) => {
                    apply(entries);
                    offset += frame_len;
                    frames += 1;
                }
                FrameRead::Eof  => break,
                FrameRead::Torn => { torn = true; break; }
            }
        }
        drop(reader);

        if torn {
            warn!(path = %path.display(), offset, dropped = len - offset,
                "discarding incomplete commit frame at end of log");
            file.set_len(offset)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(offset))?;

        info!(path = %path.display(), frames, bytes = offset, "commit log replayed");
        Ok(Self { path: path.into(), file, size: offset, frames, broken: None })
    }

    /// 追加一帧；失败时回退到追加前的文件长度
    ///
    /// 回退本身失败后日志不再接受追加，直到 [`CommitLog::rewrite`] 成功。
    pub fn append(&mut self, entries: &[Entry], codec: CompressionType, sync: bool) -> Result<u64> {
        if let Some(reason) = &self.broken {
            return Err(MappingError::Commit(format!("commit log is unusable: {reason}")));
        }

        let frame = build_frame(entries, codec)?;
        let written = self.file.write_all(&frame)
            .and_then(|_| if sync { self.file.sync_data() } else { Ok(()) });

        if let Err(e) = written {
            let size = self.size;
            let rollback = self.file.set_len(size)
                .and_then(|_| self.file.seek(SeekFrom::Start(size)));
            if let Err(re) = rollback {
                error!(path = %self.path.display(), error = %re,
                    "cannot roll back partial commit frame, refusing further appends");
                self.broken = Some(format!("rollback after failed append failed: {re}"));
            }
            return Err(MappingError::Commit(e.to_string()));
        }

        self.size   += frame.len() as u64;
        self.frames += 1;
        Ok(frame.len() as u64)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// 用给定的全部存活条目重写日志：写临时文件 → fsync → rename
    ///
    /// 每帧最多 `max_entries` 条、`max_bytes` 字节（与事务预算同一口径）。
    pub fn rewrite<'a>(
        &mut self,
        entries:     impl Iterator<Item = (&'a [u8], &'a [u8])>,
        codec:       CompressionType,
        max_entries: usize,
        max_bytes:   usize,
    ) -> Result<()> {
        let max_entries = max_entries.max(1);
        let max_bytes   = max_bytes.min(MAX_TXN_BYTES_LIMIT);

        let tmp_path = self.path.with_extension("log.compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_file_header(&mut tmp)?;

        let mut size   = FILE_HEADER_LEN;
        let mut frames = 0u64;
        let mut chunk: Vec<Entry> = Vec::new();
        let mut chunk_bytes = 0usize;
        let mut flush = |chunk: &mut Vec<Entry>, tmp: &mut File| -> Result<()> {
            if chunk.is_empty() { return Ok(()); }
            let frame = build_frame(chunk, codec)?;
            tmp.write_all(&frame)?;
            size   += frame.len() as u64;
            frames += 1;
            chunk.clear();
            Ok(())
        };

        for (k, v) in entries {
            let entry_bytes = ENTRY_PREFIX_LEN + k.len() + v.len();
            if !chunk.is_empty()
                && (chunk.len() >= max_entries || chunk_bytes + entry_bytes > max_bytes)
            {
                flush(&mut chunk, &mut tmp)?;
                chunk_bytes = 0;
            }
            chunk.push((k.to_vec(), v.to_vec()));
            chunk_bytes += entry_bytes;
        }
        flush(&mut chunk, &mut tmp)?;
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            // 目录 fsync 使 rename 持久化；部分平台不支持，忽略错误
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }

        tmp.seek(SeekFrom::End(0))?;
        self.file   = tmp;
        self.size   = size;
        self.frames = frames;
        self.broken = None;
        Ok(())
    }

    pub fn size(&self)   -> u64 { self.size }
    pub fn frames(&self) -> u64 { self.frames }
    pub fn path(&self)   -> &Path { &self.path }
}
