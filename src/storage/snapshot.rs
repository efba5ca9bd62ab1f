use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 快照文件 Header
const MAGIC: u32 = 0x5E7F_0001;
/// v1：data_len 为 u32；v2：data_len 为 u64
const VERSION_V1: u32 = 1;
const VERSION_CURRENT: u32 = 2;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE_V1: usize = 4 + 4 + 4 + 4 + 4; // magic + version + state + data_len(u32) + checksum
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 4; // magic + version + state + data_len(u64) + checksum

/// 原子快照文件（atomic replacement），group.state 与 frag-<id>.idx 共用。
///
/// 落盘流程：
/// 1) 写 `<name>.tmp` 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into(file)` 流式写 body，并边写边计算 checksum / data_len
/// 3) seek 回开头覆盖 COMMITTED header（写入真实 len/checksum）
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)：原子替换（POSIX 保证）
/// 6) fsync(dir)
///
/// 加载时校验 magic + version + state + data_len + checksum，任何不一致都视为不存在。
/// v1 header 的文件仍可读取，写入总是 v2。
pub struct SnapshotFile {
    path: PathBuf,
}

struct SimpleChecksum {
    hash: u32,
    pending: [u8; 4],
    pending_len: usize,
}

impl SimpleChecksum {
    fn new() -> Self {
        Self {
            hash: 0,
            pending: [0u8; 4],
            pending_len: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let need = 4 - self.pending_len;
            let take = need.min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];

            if self.pending_len == 4 {
                self.process_chunk(self.pending);
                self.pending_len = 0;
                self.pending = [0u8; 4];
            }
        }

        let mut chunks = data.chunks_exact(4);
        for c in &mut chunks {
            self.process_chunk([c[0], c[1], c[2], c[3]]);
        }
        let rest = chunks.remainder();
        if !rest.is_empty() {
            self.pending[..rest.len()].copy_from_slice(rest);
            self.pending_len = rest.len();
        }
    }

    fn finalize(mut self) -> u32 {
        if self.pending_len > 0 {
            let mut buf = [0u8; 4];
            buf[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
            self.process_chunk(buf);
        }
        self.hash
    }

    fn process_chunk(&mut self, chunk: [u8; 4]) {
        self.hash = self.hash.wrapping_add(u32::from_le_bytes(chunk));
        self.hash = self.hash.rotate_left(7);
    }
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    checksum: SimpleChecksum,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            checksum: SimpleChecksum::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u32) {
        (self.bytes, self.checksum.finalize())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.checksum.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn header(state: u32, data_len: u64, checksum: u32) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    h[8..12].copy_from_slice(&state.to_le_bytes());
    h[12..20].copy_from_slice(&data_len.to_le_bytes());
    h[20..24].copy_from_slice(&checksum.to_le_bytes());
    h
}

fn read_u32(data: &[u8], at: usize) -> anyhow::Result<u32> {
    Ok(u32::from_le_bytes(data[at..at + 4].try_into()?))
}

fn read_u64(data: &[u8], at: usize) -> anyhow::Result<u64> {
    Ok(u64::from_le_bytes(data[at..at + 8].try_into()?))
}

impl SnapshotFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载快照；文件不存在或校验失败返回 `None`
    pub async fn load_if_valid<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path).await?;
        if data.len() < HEADER_SIZE_V1 {
            tracing::warn!("Snapshot {} too small, ignoring", self.path.display());
            return Ok(None);
        }

        let magic = read_u32(&data, 0)?;
        let version = read_u32(&data, 4)?;
        let state = read_u32(&data, 8)?;

        if magic != MAGIC {
            tracing::warn!("Snapshot magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return Ok(None);
        }
        let (header_size, data_len, stored_checksum) = match version {
            VERSION_V1 => (HEADER_SIZE_V1, read_u32(&data, 12)? as u64, read_u32(&data, 16)?),
            VERSION_CURRENT if data.len() >= HEADER_SIZE => {
                (HEADER_SIZE, read_u64(&data, 12)?, read_u32(&data, 20)?)
            }
            _ => {
                tracing::warn!(
                    "Snapshot {} unsupported version {} (current {})",
                    self.path.display(),
                    version,
                    VERSION_CURRENT
                );
                return Ok(None);
            }
        };
        if state != STATE_COMMITTED {
            tracing::warn!("Snapshot {} INCOMPLETE, ignoring", self.path.display());
            return Ok(None);
        }

        let body = &data[header_size..];
        if body.len() as u64 != data_len {
            tracing::warn!("Snapshot {} data length mismatch", self.path.display());
            return Ok(None);
        }

        let computed = simple_checksum(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Snapshot checksum mismatch: {} != {}",
                computed,
                stored_checksum
            );
            return Ok(None);
        }

        match bincode::deserialize::<T>(body) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!(
                    "Snapshot {} deserialize failed: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// 原子写入，返回写入字节数
    pub async fn write_atomic<T: Serialize>(&self, value: &T) -> anyhow::Result<u64> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        // 1) INCOMPLETE header，然后流式写 body：避免把整个 body 序列化进一个巨型 Vec
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&header(STATE_INCOMPLETE, 0, 0))?;

        // 2) 流式写 body 并计算长度/校验
        let (data_len, checksum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, value)?;
            cw.finish()
        };

        // 3) seek 回开头覆盖 COMMITTED header
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header(STATE_COMMITTED, data_len, checksum))?;

        // 4) fsync
        file.sync_all()?;

        // 5) rename 原子替换
        std::fs::rename(&tmp_path, &self.path)?;

        // 6) fsync(dir)
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(HEADER_SIZE as u64 + data_len)
    }

    pub async fn remove(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 简单校验和（非加密，仅用于完整性检测）
fn simple_checksum(data: &[u8]) -> u32 {
    let mut c = SimpleChecksum::new();
    c.update(data);
    c.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "set-view-snapshot-{}-{}-{}",
            tag,
            std::process::id(),
            nanos
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        seqs: Vec<u64>,
    }

    #[test]
    fn checksum_is_independent_of_write_chunking() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1001).collect();
        let whole = simple_checksum(&data);
        let mut c = SimpleChecksum::new();
        for chunk in data.chunks(3) {
            c.update(chunk);
        }
        assert_eq!(c.finalize(), whole);
    }

    #[tokio::test]
    async fn write_then_load() {
        let dir = unique_tmp_dir("roundtrip");
        let f = SnapshotFile::new(dir.join("group.state"));
        assert!(f.load_if_valid::<Sample>().await.unwrap().is_none());

        let s = Sample {
            name: "p0".into(),
            seqs: vec![1, 2, 3],
        };
        let written = f.write_atomic(&s).await.unwrap();
        assert!(written > HEADER_SIZE as u64);
        assert!(!dir.join("group.state.tmp").exists());
        assert_eq!(f.load_if_valid::<Sample>().await.unwrap(), Some(s));

        f.remove().await.unwrap();
        f.remove().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn corrupt_or_incomplete_files_are_ignored() {
        let dir = unique_tmp_dir("corrupt");
        let f = SnapshotFile::new(dir.join("frag-1.idx"));
        f.write_atomic(&Sample {
            name: "x".into(),
            seqs: vec![9; 64],
        })
        .await
        .unwrap();

        let mut bytes = std::fs::read(f.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(f.path(), &bytes).unwrap();
        assert!(f.load_if_valid::<Sample>().await.unwrap().is_none());

        let mut bytes = std::fs::read(f.path()).unwrap();
        bytes[8..12].copy_from_slice(&STATE_INCOMPLETE.to_le_bytes());
        std::fs::write(f.path(), &bytes).unwrap();
        assert!(f.load_if_valid::<Sample>().await.unwrap().is_none());

        std::fs::write(f.path(), b"tiny").unwrap();
        assert!(f.load_if_valid::<Sample>().await.unwrap().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn header_carries_64_bit_length_and_v1_files_still_load() {
        let dir = unique_tmp_dir("header");
        let s = Sample {
            name: "p3".into(),
            seqs: vec![4, 5],
        };
        let f = SnapshotFile::new(dir.join("frag-3.idx"));
        f.write_atomic(&s).await.unwrap();
        let bytes = std::fs::read(f.path()).unwrap();
        assert_eq!(read_u32(&bytes, 4).unwrap(), VERSION_CURRENT);
        assert_eq!(
            read_u64(&bytes, 12).unwrap(),
            (bytes.len() - HEADER_SIZE) as u64
        );

        // 旧格式：u32 长度字段
        let body = bincode::serialize(&s).unwrap();
        let mut v1 = Vec::new();
        v1.extend_from_slice(&MAGIC.to_le_bytes());
        v1.extend_from_slice(&VERSION_V1.to_le_bytes());
        v1.extend_from_slice(&STATE_COMMITTED.to_le_bytes());
        v1.extend_from_slice(&(body.len() as u32).to_le_bytes());
        v1.extend_from_slice(&simple_checksum(&body).to_le_bytes());
        v1.extend_from_slice(&body);
        std::fs::write(f.path(), &v1).unwrap();
        assert_eq!(f.load_if_valid::<Sample>().await.unwrap(), Some(s));
        let _ = std::fs::remove_dir_all(&dir);
    }
}

