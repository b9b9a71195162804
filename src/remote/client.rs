// 远端对象存储 HTTP 客户端实现

use crate::config::OnDuplicate;
use crate::remote::types::{
    CreateFileResponse, ObjectMetadata, PrecreateResponse, RapidUploadResponse, RemoteError,
    RemoteResult, UploadSliceResponse,
};
use crate::remote::RemoteStore;
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::cookie::Jar;
use reqwest::multipart;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 数据服务器连续失败多少次后暂时跳过
const HOST_FAILURE_THRESHOLD: u32 = 3;

/// HTTP 客户端配置
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    /// 网关地址（precreate/create/rapidupload 接口），如 "https://pan.example.com"
    pub gateway: String,
    /// 数据服务器主机列表（分片上传接口），轮询使用
    pub data_hosts: Vec<String>,
    /// 初始认证 Cookie（name=value，分号分隔），预置进 Cookie Jar
    pub auth_cookie: String,
    /// 应用ID
    pub app_id: String,
    /// User-Agent
    pub user_agent: String,
    /// 请求超时（秒）
    pub timeout_secs: u64,
    /// 单任务最大连接数（透传自上传配置）
    pub max_threads_per_task: usize,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            gateway: "https://pan.example.com".to_string(),
            data_hosts: vec!["d.pcs.example.com".to_string()],
            auth_cookie: String::new(),
            app_id: "250528".to_string(),
            user_agent: "pan-uploader/0.3".to_string(),
            timeout_secs: 60,
            max_threads_per_task: 1,
        }
    }
}

/// 远端对象存储 HTTP 客户端
///
/// 数据服务器按轮询选取，连续失败的主机暂时跳过，
/// 全部不可用时清零失败计数重新轮询
#[derive(Debug)]
pub struct HttpRemote {
    /// HTTP 客户端
    client: Client,
    /// 配置
    config: HttpRemoteConfig,
    /// 数据服务器轮询游标
    host_cursor: AtomicUsize,
    /// 数据服务器连续失败计数
    host_failures: DashMap<String, u32>,
}

impl HttpRemote {
    /// 创建 HTTP 客户端
    ///
    /// 认证 Cookie 预置进 Cookie Jar，后续响应里的 Set-Cookie 自动合并，
    /// 网关与各数据服务器共用同一套 Cookie
    pub fn new(config: HttpRemoteConfig) -> anyhow::Result<Self> {
        if config.data_hosts.is_empty() {
            anyhow::bail!("数据服务器列表不能为空");
        }

        let gateway_url = config
            .gateway
            .parse::<reqwest::Url>()
            .context(format!("网关地址无效: {}", config.gateway))?;

        let jar = Arc::new(Jar::default());
        for pair in config
            .auth_cookie
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            jar.add_cookie_str(&format!("{}; Path=/", pair), &gateway_url);
            for host in &config.data_hosts {
                if let Ok(url) = format!("https://{}/", host).parse::<reqwest::Url>() {
                    jar.add_cookie_str(&format!("{}; Path=/", pair), &url);
                }
            }
            debug!("预置 Cookie: {}", pair.split('=').next().unwrap_or(""));
        }

        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.max_threads_per_task.max(1))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("创建 HTTP 客户端失败")?;

        info!(
            "初始化远端客户端: gateway={}, 数据服务器 {} 个",
            config.gateway,
            config.data_hosts.len()
        );

        Ok(Self {
            client,
            config,
            host_cursor: AtomicUsize::new(0),
            host_failures: DashMap::new(),
        })
    }

    /// 选取下一个数据服务器（轮询，跳过连续失败的主机）
    fn pick_data_host(&self) -> String {
        let hosts = &self.config.data_hosts;
        let start = self.host_cursor.fetch_add(1, Ordering::Relaxed);

        for offset in 0..hosts.len() {
            let host = &hosts[(start + offset) % hosts.len()];
            let failures = self
                .host_failures
                .get(host)
                .map(|f| *f.value())
                .unwrap_or(0);
            if failures < HOST_FAILURE_THRESHOLD {
                return host.clone();
            }
        }

        // 全部被跳过：清零失败计数，重新开始轮询
        warn!("所有数据服务器均连续失败，重置失败计数");
        self.host_failures.clear();
        hosts[start % hosts.len()].clone()
    }

    fn record_host_failure(&self, host: &str) {
        let mut entry = self.host_failures.entry(host.to_string()).or_insert(0);
        *entry += 1;
    }

    fn record_host_success(&self, host: &str) {
        self.host_failures.remove(host);
    }

    /// 发送表单请求并按 JSON 解析响应
    async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> RemoteResult<T> {
        let response = self
            .client
            .post(url)
            .header("User-Agent", &self.config.user_agent)
            .form(form)
            .send()
            .await
            .map_err(|e| RemoteError::transport(anyhow::Error::new(e).context("请求发送失败")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::transport(anyhow::Error::new(e).context("读取响应失败")))?;

        debug!("响应: url={}, status={}, body={}", url, status, body);

        serde_json::from_str(&body).map_err(|e| {
            RemoteError::transport(
                anyhow::Error::new(e).context(format!("解析响应失败: status={}", status)),
            )
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn rapid_upload(
        &self,
        remote_path: &str,
        content_length: u64,
        content_md5: &str,
        content_crc32: &str,
        slice_md5: &str,
        on_dup: OnDuplicate,
    ) -> RemoteResult<ObjectMetadata> {
        info!("秒传请求: path={}, size={}", remote_path, content_length);

        let url = format!("{}/api/rapidupload", self.config.gateway);
        let form = [
            ("path", remote_path.to_string()),
            ("content-length", content_length.to_string()),
            ("content-md5", content_md5.to_string()),
            ("content-crc32", content_crc32.to_string()),
            ("slice-md5", slice_md5.to_string()),
            ("ondup", on_dup.as_wire().to_string()),
        ];

        let resp: RapidUploadResponse = self.post_form(&url, &form).await?;

        if resp.errno != 0 {
            debug!(
                "秒传未成功: path={}, errno={}, errmsg={}",
                remote_path, resp.errno, resp.errmsg
            );
            return Err(RemoteError::errno(resp.errno, resp.errmsg));
        }

        info!("秒传成功: path={}, fs_id={}", remote_path, resp.meta.fs_id);
        Ok(resp.meta)
    }

    async fn precreate(&self, remote_path: &str, slice_count: usize) -> RemoteResult<String> {
        info!("预创建: path={}, 分片数={}", remote_path, slice_count);

        let url = format!("{}/api/precreate", self.config.gateway);
        let form = [
            ("path", remote_path.to_string()),
            ("block_count", slice_count.to_string()),
            ("isdir", "0".to_string()),
            ("autoinit", "1".to_string()),
        ];

        let resp: PrecreateResponse = self.post_form(&url, &form).await?;

        if resp.errno != 0 {
            error!(
                "预创建失败: path={}, errno={}, errmsg={}",
                remote_path, resp.errno, resp.errmsg
            );
            return Err(RemoteError::errno(resp.errno, resp.errmsg));
        }

        debug!("预创建成功: uploadid={}", resp.uploadid);
        Ok(resp.uploadid)
    }

    async fn upload_slice(
        &self,
        remote_path: &str,
        upload_session_id: &str,
        slice_index: usize,
        data: Vec<u8>,
    ) -> RemoteResult<String> {
        let host = self.pick_data_host();

        debug!(
            "上传分片: path={}, uploadid={}..., seq={}, size={}, host={}",
            remote_path,
            &upload_session_id[..8.min(upload_session_id.len())],
            slice_index,
            data.len(),
            host
        );

        let url = format!(
            "https://{}/rest/2.0/pcs/superfile2?\
             method=upload&\
             app_id={}&\
             type=tmpfile&\
             path={}&\
             uploadid={}&\
             partseq={}",
            host,
            self.config.app_id,
            urlencoding::encode(remote_path),
            urlencoding::encode(upload_session_id),
            slice_index
        );

        let part = multipart::Part::bytes(data)
            .file_name("file")
            .mime_str("application/octet-stream")
            .map_err(|e| RemoteError::transport(anyhow::Error::new(e).context("构建分片表单失败")))?;
        let form = multipart::Form::new().part("file", part);

        let send_result = self
            .client
            .post(&url)
            .header("User-Agent", &self.config.user_agent)
            .multipart(form)
            .send()
            .await;

        let response = match send_result {
            Ok(r) => r,
            Err(e) => {
                self.record_host_failure(&host);
                return Err(RemoteError::transport(
                    anyhow::Error::new(e).context("分片请求发送失败"),
                ));
            }
        };

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            self.record_host_failure(&host);
            RemoteError::transport(anyhow::Error::new(e).context("读取分片响应失败"))
        })?;

        debug!(
            "分片响应: seq={}, status={}, body={}",
            slice_index, status, body
        );

        let resp: UploadSliceResponse = serde_json::from_str(&body).map_err(|e| {
            RemoteError::transport(
                anyhow::Error::new(e)
                    .context(format!("解析分片响应失败: status={}, body={}", status, body)),
            )
        })?;

        if resp.error_code != 0 {
            self.record_host_failure(&host);
            error!(
                "分片上传失败: seq={}, error_code={}, error_msg={}",
                slice_index, resp.error_code, resp.error_msg
            );
            return Err(RemoteError::errno(resp.error_code, resp.error_msg));
        }

        self.record_host_success(&host);
        // 服务端可能返回空标识，由上传引擎原位重试
        Ok(resp.md5)
    }

    async fn create_super_file(
        &self,
        remote_path: &str,
        upload_session_id: &str,
        slice_ids: &[String],
        content_length: u64,
        on_dup: OnDuplicate,
    ) -> RemoteResult<ObjectMetadata> {
        info!(
            "合并分片: path={}, 分片数={}, size={}",
            remote_path,
            slice_ids.len(),
            content_length
        );

        let block_list = serde_json::to_string(slice_ids)
            .map_err(|e| RemoteError::transport(anyhow::Error::new(e).context("序列化分片列表失败")))?;

        let url = format!("{}/api/create", self.config.gateway);
        let form = [
            ("path", remote_path.to_string()),
            ("size", content_length.to_string()),
            ("uploadid", upload_session_id.to_string()),
            ("block_list", block_list),
            ("isdir", "0".to_string()),
            ("ondup", on_dup.as_wire().to_string()),
        ];

        let resp: CreateFileResponse = self.post_form(&url, &form).await?;

        if resp.errno != 0 {
            error!(
                "合并分片失败: path={}, errno={}, errmsg={}",
                remote_path, resp.errno, resp.errmsg
            );
            return Err(RemoteError::errno(resp.errno, resp.errmsg));
        }

        // fs_id == 0 的成功响应表示服务端尚未就绪，调用方按"重试"处理
        Ok(resp.meta)
    }
}
