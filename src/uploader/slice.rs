// 分片传输
//
// 协议分片规则：
// - 分片窗口固定 4MB，末片可以更短
// - 分片序号与字节区间严格对应：第 i 片覆盖 [i*4MB, min((i+1)*4MB, 文件大小))
// - 服务端确认后返回分片标识；空标识表示该片需原位重试

use crate::remote::{RemoteError, RemoteStore};
use crate::uploader::limit::SpeedLimiter;
use crate::uploader::source::SourceStream;
use anyhow::Context;
use std::io::{Read, Seek, SeekFrom};
use tracing::debug;

/// 分片窗口大小: 4MB
pub const SLICE_SIZE: u64 = 4 * 1024 * 1024;

/// 秒传头部摘要窗口: 256KB
pub const HEAD_DIGEST_SIZE: u64 = 262144;

/// 哈希读取缓冲区大小
pub const READ_BUFFER_SIZE: usize = 8192;

/// 限速与进度上报步长（READ_BUFFER_SIZE 的整数倍）
const THROTTLE_STEP: usize = 64 * 1024;

/// 分片数量: ⌈文件大小 / 4MB⌉，空文件按 1 片处理
pub fn slice_count(content_length: u64) -> usize {
    if content_length == 0 {
        1
    } else {
        content_length.div_ceil(SLICE_SIZE) as usize
    }
}

/// 第 index 片的字节区间长度
pub fn slice_len(content_length: u64, index: usize) -> u64 {
    let offset = index as u64 * SLICE_SIZE;
    SLICE_SIZE.min(content_length.saturating_sub(offset))
}

/// 分片传输失败
#[derive(Debug)]
pub enum SliceTransferError {
    /// 本地读取失败
    Io(anyhow::Error),
    /// 远端失败（协议错误或传输故障）
    Remote(RemoteError),
}

impl std::fmt::Display for SliceTransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceTransferError::Io(e) => write!(f, "本地读取失败: {}", e),
            SliceTransferError::Remote(e) => write!(f, "{}", e),
        }
    }
}

/// 分片传输器
///
/// 单次调用完成一个 4MB 窗口的外发：定位源流、限速读取、提交远端
pub struct SliceTransport<'a> {
    remote: &'a dyn RemoteStore,
    limiter: &'a SpeedLimiter,
}

impl<'a> SliceTransport<'a> {
    pub fn new(remote: &'a dyn RemoteStore, limiter: &'a SpeedLimiter) -> Self {
        Self { remote, limiter }
    }

    /// 传输第 `slice_index` 片
    ///
    /// 源流仅在当前位置与分片起点不一致时 seek；传输完成后流停在分片末尾，
    /// 顺序上传时无需重复定位。`progress` 以分片内已处理字节数回调。
    ///
    /// # 返回
    /// 源流（归还给调用方复用）和服务端分片标识；
    /// 标识可能为空，表示该片需要原位重试
    pub async fn transfer(
        &self,
        stream: Box<dyn SourceStream>,
        remote_path: &str,
        upload_session_id: &str,
        slice_index: usize,
        content_length: u64,
        progress: &(dyn Fn(u64) + Sync),
    ) -> Result<(Box<dyn SourceStream>, String), SliceTransferError> {
        let offset = slice_index as u64 * SLICE_SIZE;
        let len = slice_len(content_length, slice_index) as usize;

        // 在阻塞线程池中定位并读出整个窗口
        let (stream, data) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let mut stream = stream;
            let pos = stream.stream_position().context("查询源流位置失败")?;
            if pos != offset {
                stream
                    .seek(SeekFrom::Start(offset))
                    .context("定位分片起点失败")?;
            }

            let mut data = vec![0u8; len];
            stream.read_exact(&mut data).context("读取分片数据失败")?;
            Ok((stream, data))
        })
        .await
        .map_err(|e| SliceTransferError::Io(anyhow::Error::new(e).context("分片读取任务失败")))?
        .map_err(SliceTransferError::Io)?;

        // 限速 + 进度按固定步长推进
        let mut current = 0u64;
        for step in data.chunks(THROTTLE_STEP) {
            self.limiter.throttle(step.len() as u64).await;
            current += step.len() as u64;
            progress(current);
        }

        debug!(
            "提交分片: seq={}, 区间={}..{}, size={}",
            slice_index,
            offset,
            offset + len as u64,
            len
        );

        let slice_id = self
            .remote
            .upload_slice(remote_path, upload_session_id, slice_index, data)
            .await
            .map_err(SliceTransferError::Remote)?;

        Ok((stream, slice_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OnDuplicate;
    use crate::remote::{ObjectMetadata, RemoteResult};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// 记录收到分片的测试远端
    #[derive(Default)]
    struct RecordingRemote {
        slices: StdMutex<Vec<(usize, Vec<u8>)>>,
    }

    #[async_trait]
    impl RemoteStore for RecordingRemote {
        async fn rapid_upload(
            &self,
            _remote_path: &str,
            _content_length: u64,
            _content_md5: &str,
            _content_crc32: &str,
            _slice_md5: &str,
            _on_dup: OnDuplicate,
        ) -> RemoteResult<ObjectMetadata> {
            unreachable!("秒传不在本测试范围")
        }

        async fn precreate(&self, _remote_path: &str, _slice_count: usize) -> RemoteResult<String> {
            unreachable!()
        }

        async fn upload_slice(
            &self,
            _remote_path: &str,
            _upload_session_id: &str,
            slice_index: usize,
            data: Vec<u8>,
        ) -> RemoteResult<String> {
            let id = format!("sid-{}", slice_index);
            self.slices.lock().unwrap().push((slice_index, data));
            Ok(id)
        }

        async fn create_super_file(
            &self,
            _remote_path: &str,
            _upload_session_id: &str,
            _slice_ids: &[String],
            _content_length: u64,
            _on_dup: OnDuplicate,
        ) -> RemoteResult<ObjectMetadata> {
            unreachable!()
        }
    }

    /// 统计 seek 次数的源流包装
    #[derive(Debug)]
    struct SeekCounter {
        inner: Cursor<Vec<u8>>,
        seeks: std::sync::Arc<AtomicUsize>,
    }

    impl Read for SeekCounter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Seek for SeekCounter {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            // stream_position 会以 Current(0) 调用，不计入
            if pos != SeekFrom::Current(0) {
                self.seeks.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.seek(pos)
        }
    }

    #[test]
    fn test_slice_count() {
        assert_eq!(slice_count(0), 1);
        assert_eq!(slice_count(1), 1);
        assert_eq!(slice_count(SLICE_SIZE), 1);
        assert_eq!(slice_count(SLICE_SIZE + 1), 2);
        assert_eq!(slice_count(10 * 1024 * 1024), 3);
    }

    #[test]
    fn test_slice_len() {
        let total = SLICE_SIZE + 100;
        assert_eq!(slice_len(total, 0), SLICE_SIZE);
        assert_eq!(slice_len(total, 1), 100);
        assert_eq!(slice_len(0, 0), 0);
    }

    #[tokio::test]
    async fn test_transfer_small_slice() {
        let remote = RecordingRemote::default();
        let limiter = SpeedLimiter::unlimited();
        let transport = SliceTransport::new(&remote, &limiter);

        let content: Vec<u8> = (0..100u8).collect();
        let stream: Box<dyn SourceStream> = Box::new(Cursor::new(content.clone()));

        let last_progress = AtomicU64::new(0);
        let (_stream, slice_id) = transport
            .transfer(stream, "/t.bin", "session-1", 0, 100, &|cur| {
                last_progress.store(cur, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(slice_id, "sid-0");
        assert_eq!(last_progress.load(Ordering::SeqCst), 100);

        let slices = remote.slices.lock().unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].0, 0);
        assert_eq!(slices[0].1, content);
    }

    #[tokio::test]
    async fn test_transfer_skips_seek_when_positioned() {
        let remote = RecordingRemote::default();
        let limiter = SpeedLimiter::unlimited();
        let transport = SliceTransport::new(&remote, &limiter);

        let content = vec![7u8; (SLICE_SIZE + 1024) as usize];
        let seeks = std::sync::Arc::new(AtomicUsize::new(0));
        let stream: Box<dyn SourceStream> = Box::new(SeekCounter {
            inner: Cursor::new(content.clone()),
            seeks: seeks.clone(),
        });

        // 第 0 片：流起始位置即分片起点，不应 seek
        let (stream, _) = transport
            .transfer(stream, "/t.bin", "s", 0, content.len() as u64, &|_| {})
            .await
            .unwrap();
        assert_eq!(seeks.load(Ordering::SeqCst), 0);

        // 第 1 片：顺序续传，位置已在分片起点，同样不应 seek
        let (stream, _) = transport
            .transfer(stream, "/t.bin", "s", 1, content.len() as u64, &|_| {})
            .await
            .unwrap();
        assert_eq!(seeks.load(Ordering::SeqCst), 0);

        // 回头重传第 0 片：位置不一致，必须 seek
        let _ = transport
            .transfer(stream, "/t.bin", "s", 0, content.len() as u64, &|_| {})
            .await
            .unwrap();
        assert_eq!(seeks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transfer_empty_slice() {
        let remote = RecordingRemote::default();
        let limiter = SpeedLimiter::unlimited();
        let transport = SliceTransport::new(&remote, &limiter);

        let stream: Box<dyn SourceStream> = Box::new(Cursor::new(Vec::new()));
        let (_stream, slice_id) = transport
            .transfer(stream, "/empty.bin", "s", 0, 0, &|_| {})
            .await
            .unwrap();

        assert_eq!(slice_id, "sid-0");
        assert!(remote.slices.lock().unwrap()[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_transfer_read_failure_is_io() {
        let remote = RecordingRemote::default();
        let limiter = SpeedLimiter::unlimited();
        let transport = SliceTransport::new(&remote, &limiter);

        // 流比声称的长度短，read_exact 必然失败
        let stream: Box<dyn SourceStream> = Box::new(Cursor::new(vec![0u8; 10]));
        let err = transport
            .transfer(stream, "/t.bin", "s", 0, 100, &|_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, SliceTransferError::Io(_)));
    }
}
