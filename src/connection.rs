// src/connection.rs
//! 共享连接
//!
//! 一个 Connection 包装一个存储（命令通道 + 通知通道），可以被任意多个集合共享，
//! clone 只增加引用计数。集合在构造时显式传入 Connection，不存在全局注册表。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Duration;
use tracing::info;

use crate::config::{Config, StoreUrl};
use crate::error::{Error, Result};
use crate::monitor::Metrics;
use crate::store::{EmbeddedStore, RedisStore, Store};

struct Inner {
    store: Arc<dyn Store>,
    open: AtomicBool,
    metrics: Arc<Metrics>,
    marker_prefix: String,
    sync_on_start: bool,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// 按配置建立连接
    pub async fn connect(cfg: &Config) -> Result<Connection> {
        let url = cfg.validate()?;
        let scan = Duration::from_millis(cfg.expire_scan_interval_ms);
        let store: Arc<dyn Store> = match &url {
            StoreUrl::Redis { host, port, db } => Arc::new(RedisStore::connect(host, *port, *db).await?),
            StoreUrl::Embedded { path: Some(path) } => Arc::new(EmbeddedStore::open(path, scan)?),
            StoreUrl::Embedded { path: None } => Arc::new(EmbeddedStore::temporary(scan)?),
        };
        info!(url = %cfg.store_url, "store connected");
        Ok(Self::from_parts(store, cfg))
    }

    /// 只给出地址，其余取默认配置
    pub async fn connect_url(url: &str) -> Result<Connection> {
        let cfg = Config { store_url: url.to_string(), ..Config::default() };
        Self::connect(&cfg).await
    }

    /// 包装一个已经建立好的存储，例如同一进程内多条连接共用一个 EmbeddedStore
    pub fn with_store(store: Arc<dyn Store>) -> Connection {
        Self::from_parts(store, &Config::default())
    }

    fn from_parts(store: Arc<dyn Store>, cfg: &Config) -> Connection {
        Connection {
            inner: Arc::new(Inner {
                store,
                open: AtomicBool::new(true),
                metrics: Arc::new(Metrics::new()),
                marker_prefix: cfg.marker_prefix.clone(),
                sync_on_start: cfg.sync_on_start,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::Connection("connection has been disconnected".into()))
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn marker_prefix(&self) -> &str {
        &self.inner.marker_prefix
    }

    pub fn sync_on_start(&self) -> bool {
        self.inner.sync_on_start
    }

    /// 断开连接；所有共享该连接的集合之后的操作都会失败
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            self.inner.store.shutdown().await?;
            info!("store disconnected");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.is_connected())
            .field("marker_prefix", &self.inner.marker_prefix)
            .finish()
    }
}
