// src/config.rs
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

use crate::error::{Error, Result};

/// 进程启动后，从配置文件中读到的全局配置
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 共享存储地址：redis://host:port/db、sled://<dir> 或 memory://
    pub store_url: String,
    /// 过期标记 key 的前缀，互通时必须为 "rmap"
    pub marker_prefix: String,
    /// 集合创建后是否立即从存储拉取全量快照
    pub sync_on_start: bool,
    /// 内嵌存储后台过期扫描周期（毫秒）
    pub expire_scan_interval_ms: u64,
    // 监控配置
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store_url: "sled://rmap-data".into(),
            marker_prefix: crate::expire::DEFAULT_MARKER_PREFIX.into(),
            sync_on_start: true,
            expire_scan_interval_ms: 100,
            metrics_enabled: false,
            metrics_port: 9464,
        }
    }
}

impl Config {
    /// 校验配置，返回解析后的存储地址
    pub fn validate(&self) -> Result<StoreUrl> {
        if self.marker_prefix.is_empty() {
            return Err(Error::Config("marker_prefix must not be empty".into()));
        }
        if self.expire_scan_interval_ms == 0 {
            return Err(Error::Config("expire_scan_interval_ms must be greater than zero".into()));
        }
        StoreUrl::parse(&self.store_url)
    }
}

/// 解析后的存储地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    Redis { host: String, port: u16, db: u32 },
    /// path 为 None 时使用临时 sled 实例
    Embedded { path: Option<PathBuf> },
}

impl StoreUrl {
    pub fn parse(url: &str) -> Result<StoreUrl> {
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::Config("missing store url".into()));
        }

        if let Some(rest) = url.strip_prefix("redis://") {
            // 去掉可能存在的 user:pass@ 部分，认证不在本库范围内
            let rest = rest.rsplit_once('@').map(|(_, r)| r).unwrap_or(rest);
            let (addr, db) = match rest.split_once('/') {
                Some((addr, "")) => (addr, 0),
                Some((addr, db)) => {
                    let db = db
                        .parse::<u32>()
                        .map_err(|_| Error::Config(format!("invalid redis db index '{}'", db)))?;
                    (addr, db)
                }
                None => (rest, 0),
            };
            let (host, port) = match addr.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| Error::Config(format!("invalid redis port '{}'", port)))?;
                    (host, port)
                }
                None => (addr, 6379),
            };
            if host.is_empty() {
                return Err(Error::Config(format!("missing redis host in '{}'", url)));
            }
            return Ok(StoreUrl::Redis { host: host.to_string(), port, db });
        }

        if let Some(path) = url.strip_prefix("sled://") {
            if path.is_empty() {
                return Ok(StoreUrl::Embedded { path: None });
            }
            return Ok(StoreUrl::Embedded { path: Some(PathBuf::from(path)) });
        }

        if url == "memory://" {
            return Ok(StoreUrl::Embedded { path: None });
        }

        Err(Error::Config(format!("unsupported store url '{}'", url)))
    }
}

/// 从指定路径读取并反序列化 JSON 配置
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path_ref = path.as_ref();

    // 如果配置文件不存在，创建默认配置
    if !path_ref.exists() {
        let default_cfg = Config::default();
        let default_json = serde_json::to_string_pretty(&default_cfg)?;
        fs::write(path_ref, default_json)?;
        info!(path = ?path_ref, "default config created");
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path_ref)
        .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path_ref, e)))?;
    let cfg: Config = serde_json::from_str(&data)
        .map_err(|e| Error::Config(format!("failed to parse {:?}: {}", path_ref, e)))?;
    cfg.validate()?;
    Ok(cfg)
}
