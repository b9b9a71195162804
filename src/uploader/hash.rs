// 秒传摘要计算
//
// 秒传协议需要两个摘要：
// 1. 文件完整 MD5 (content_md5)
// 2. 文件前 256KB 的 MD5 (slice_md5)
// 另附 CRC32。文件不足 256KB 时 slice_md5 定义为空（不是零字节的 MD5），
// 此时不会尝试秒传

use crate::uploader::slice::{HEAD_DIGEST_SIZE, READ_BUFFER_SIZE};
use crate::uploader::source::SourceFilter;
use crate::uploader::task::TrackedFile;
use anyhow::{Context, Result};
use crc32fast::Hasher as Crc32Hasher;
use md5::Context as Md5Context;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::debug;

/// 摘要进度回调 (已读字节数, 总字节数)
pub type HashProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 秒传所需的全套摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RapidUploadDigests {
    /// 文件大小
    pub content_length: u64,
    /// 完整内容 MD5
    pub content_md5: String,
    /// 内容 CRC32（十进制字符串）
    pub content_crc32: String,
    /// 前 256KB MD5，文件不足 256KB 时为空
    pub slice_md5: String,
}

/// 摘要计算过滤器
///
/// 单次顺序读完源流，只补算缺失的摘要字段；
/// 调用方预供的摘要视为可信，原样保留
pub struct HashingFilter;

impl HashingFilter {
    /// 计算摘要（文件 I/O 在阻塞线程池中执行）
    pub async fn compute(
        source: Arc<dyn SourceFilter>,
        file: TrackedFile,
        progress: Option<HashProgress>,
    ) -> Result<RapidUploadDigests> {
        tokio::task::spawn_blocking(move || Self::compute_sync(source.as_ref(), &file, progress))
            .await
            .context("摘要计算任务执行失败")?
    }

    fn compute_sync(
        source: &dyn SourceFilter,
        file: &TrackedFile,
        progress: Option<HashProgress>,
    ) -> Result<RapidUploadDigests> {
        let path = &file.local_path;
        let mut stream = source
            .open(path)
            .context(format!("无法打开文件: {:?}", path))?;

        let content_length = match file.content_length {
            Some(len) => len,
            None => {
                let len = stream.seek(SeekFrom::End(0)).context("查询文件大小失败")?;
                stream.seek(SeekFrom::Start(0)).context("回绕文件失败")?;
                len
            }
        };

        let slice_known = file.slice_md5.is_some() || content_length < HEAD_DIGEST_SIZE;
        let need_pass =
            file.content_md5.is_none() || file.content_crc32.is_none() || !slice_known;

        if !need_pass {
            debug!("摘要已齐备，跳过读取: {:?}", path);
            if let Some(cb) = &progress {
                cb(content_length, content_length);
            }
            return Ok(RapidUploadDigests {
                content_length,
                content_md5: file.content_md5.clone().unwrap_or_default(),
                content_crc32: file.content_crc32.clone().unwrap_or_default(),
                slice_md5: file.slice_md5.clone().unwrap_or_default(),
            });
        }

        let mut full_hasher = Md5Context::new();
        let mut crc_hasher = Crc32Hasher::new();
        let mut head_hasher = Md5Context::new();
        let mut head_bytes: u64 = 0;
        let mut total_read: u64 = 0;
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = stream.read(&mut buffer).context("读取文件失败")?;
            if n == 0 {
                break;
            }

            full_hasher.consume(&buffer[..n]);
            crc_hasher.update(&buffer[..n]);

            if head_bytes < HEAD_DIGEST_SIZE {
                let take = ((HEAD_DIGEST_SIZE - head_bytes) as usize).min(n);
                head_hasher.consume(&buffer[..take]);
                head_bytes += take as u64;
            }

            total_read += n as u64;
            if let Some(cb) = &progress {
                cb(total_read, content_length);
            }
        }

        let content_md5 = file
            .content_md5
            .clone()
            .unwrap_or_else(|| format!("{:x}", full_hasher.compute()));
        let content_crc32 = file
            .content_crc32
            .clone()
            .unwrap_or_else(|| crc_hasher.finalize().to_string());
        let slice_md5 = match &file.slice_md5 {
            Some(known) => known.clone(),
            None if content_length >= HEAD_DIGEST_SIZE => {
                format!("{:x}", head_hasher.compute())
            }
            None => String::new(),
        };

        debug!(
            "摘要计算完成: path={:?}, size={}, md5={}, crc32={}, slice_md5={}",
            path, content_length, content_md5, content_crc32, slice_md5
        );

        Ok(RapidUploadDigests {
            content_length,
            content_md5,
            content_crc32,
            slice_md5,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::source::Passthrough;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::NamedTempFile;

    fn write_temp(content: &[u8]) -> NamedTempFile {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(content).unwrap();
        temp.flush().unwrap();
        temp
    }

    async fn compute(file: TrackedFile) -> RapidUploadDigests {
        HashingFilter::compute(Arc::new(Passthrough), file, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_small_file_has_empty_slice_md5() {
        let temp = write_temp(b"Hello, World!");
        let digests = compute(TrackedFile::new(temp.path())).await;

        assert_eq!(digests.content_length, 13);
        assert_eq!(digests.content_md5, format!("{:x}", md5::compute(b"Hello, World!")));
        assert!(digests.slice_md5.is_empty());
        assert!(!digests.content_crc32.is_empty());
    }

    #[tokio::test]
    async fn test_boundary_262144_computes_slice_md5() {
        let content = vec![0xabu8; 262144];
        let temp = write_temp(&content);
        let digests = compute(TrackedFile::new(temp.path())).await;

        assert_eq!(digests.content_length, 262144);
        // 恰好 256KB 时前 256KB 即整个文件
        assert_eq!(digests.slice_md5, digests.content_md5);
    }

    #[tokio::test]
    async fn test_boundary_262143_has_empty_slice_md5() {
        let content = vec![0xabu8; 262143];
        let temp = write_temp(&content);
        let digests = compute(TrackedFile::new(temp.path())).await;
        assert!(digests.slice_md5.is_empty());
    }

    #[tokio::test]
    async fn test_large_file_distinct_digests() {
        let content = vec![0x5au8; 512 * 1024];
        let temp = write_temp(&content);
        let digests = compute(TrackedFile::new(temp.path())).await;

        assert_eq!(digests.content_length, 512 * 1024);
        assert_ne!(digests.slice_md5, digests.content_md5);
        assert_eq!(
            digests.slice_md5,
            format!("{:x}", md5::compute(&content[..262144]))
        );
    }

    #[tokio::test]
    async fn test_known_digests_are_trusted() {
        let temp = write_temp(&vec![1u8; 300 * 1024]);
        let mut file = TrackedFile::new(temp.path());
        file.content_md5 = Some("supplied-md5".to_string());
        file.content_crc32 = Some("12345".to_string());
        file.slice_md5 = Some("supplied-slice".to_string());

        let digests = compute(file).await;
        assert_eq!(digests.content_md5, "supplied-md5");
        assert_eq!(digests.content_crc32, "12345");
        assert_eq!(digests.slice_md5, "supplied-slice");
    }

    #[tokio::test]
    async fn test_partial_known_computes_missing_only() {
        let content = vec![9u8; 300 * 1024];
        let temp = write_temp(&content);
        let mut file = TrackedFile::new(temp.path());
        file.content_md5 = Some("keep-me".to_string());

        let digests = compute(file).await;
        // 已知的保留，缺的补算
        assert_eq!(digests.content_md5, "keep-me");
        assert_eq!(
            digests.slice_md5,
            format!("{:x}", md5::compute(&content[..262144]))
        );
    }

    #[tokio::test]
    async fn test_progress_reaches_total() {
        let content = vec![3u8; 100_000];
        let temp = write_temp(&content);

        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let progress: HashProgress = Arc::new(move |read, total| {
            assert!(read <= total);
            seen_cb.store(read, Ordering::SeqCst);
        });

        HashingFilter::compute(Arc::new(Passthrough), TrackedFile::new(temp.path()), Some(progress))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 100_000);
    }

    #[tokio::test]
    async fn test_missing_file_propagates_error() {
        let file = TrackedFile::new("/nonexistent/file.bin");
        let result = HashingFilter::compute(Arc::new(Passthrough), file, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_file() {
        let temp = write_temp(b"");
        let digests = compute(TrackedFile::new(temp.path())).await;
        assert_eq!(digests.content_length, 0);
        assert!(digests.slice_md5.is_empty());
        // 空内容的 MD5 是固定值
        assert_eq!(digests.content_md5, "d41d8cd98f00b204e9800998ecf8427e");
    }
}
