// 本地源过滤器
//
// 哈希计算与分片读取都经由 SourceFilter 打开字节流。
// 默认实现直接打开本地文件；启用加密上传时由调用方注入
// 外部密钥管理器支撑的加密过滤器，引擎上传的即是密文流

use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::Path;

/// 可读可定位的源字节流
pub trait SourceStream: Read + Seek + Send + std::fmt::Debug {}

impl<T: Read + Seek + Send + std::fmt::Debug> SourceStream for T {}

/// 源过滤器：把本地路径变成待上传的字节流
pub trait SourceFilter: Send + Sync {
    /// 打开源流，失败时返回底层 I/O 错误
    fn open(&self, path: &Path) -> io::Result<Box<dyn SourceStream>>;
}

/// 直通过滤器（默认）：原样读取本地文件
#[derive(Debug, Default)]
pub struct Passthrough;

impl SourceFilter for Passthrough {
    fn open(&self, path: &Path) -> io::Result<Box<dyn SourceStream>> {
        Ok(Box::new(File::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{SeekFrom, Write};
    use tempfile::NamedTempFile;

    #[test]
    fn test_passthrough_reads_file() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"hello stream").unwrap();
        temp.flush().unwrap();

        let mut stream = Passthrough.open(temp.path()).unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello stream");

        stream.seek(SeekFrom::Start(6)).unwrap();
        let mut tail = String::new();
        stream.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "stream");
    }

    #[test]
    fn test_passthrough_missing_file() {
        assert!(Passthrough.open(Path::new("/nonexistent/file.bin")).is_err());
    }
}
