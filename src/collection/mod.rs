// src/collection/mod.rs

//! # 集合模块
//!
//! `Collection` 是一个具名的、多进程复制的 key-value 映射：
//! - 读操作（get / has / entries）只查本地副本，从不访问存储。
//! - 写操作（set / delete / clear）先乐观地改本地副本，再把完整快照写回存储
//!   （存储中集合名对应的 key 保存整张表的 JSON），最后在集合频道上广播变更。
//! - 写入或广播失败时错误返回给调用方，但本地修改不回滚，直到下一次成功写入或 sync 前
//!   本地与存储可能不一致。
//! - 带 TTL 的 set 额外写一个过期标记，标记过期时所有进程各自驱逐该 key。
//! - 通知流断开（或集合已 close）后本地副本不再收敛，写操作和 sync 返回 Error::Connection；
//!   读操作仍返回最后已知的内容，可用 `is_live()` 判断。
pub mod listener;
pub mod replica;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::expire::{MARKER_SENTINEL, MarkerScheme};
use crate::message::ChangeMessage;
use crate::monitor::{Metrics, Monitor, MonitorSink};
use listener::Listener;
pub use replica::{Replica, ReplicaEvent};

/// 构造集合时的可选项，未设置的字段取 Connection 上的配置
#[derive(Clone, Default)]
pub struct CollectionOptions {
    pub sync_on_start: Option<bool>,
    pub marker_prefix: Option<String>,
    pub monitor: Option<MonitorSink>,
}

impl CollectionOptions {
    pub fn with_monitor(mut self, sink: MonitorSink) -> Self {
        self.monitor = Some(sink);
        self
    }

    pub fn sync_on_start(mut self, enabled: bool) -> Self {
        self.sync_on_start = Some(enabled);
        self
    }
}

pub struct Collection {
    name: String,
    conn: Connection,
    scheme: MarkerScheme,
    replica: Arc<Replica>,
    monitor: Monitor,
    live: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Collection {
    /// 创建空集合并订阅集合频道和过期事件，不读取快照
    pub async fn new(conn: &Connection, name: &str, options: CollectionOptions) -> Result<Self> {
        conn.ensure_open()?;
        let prefix = options.marker_prefix.as_deref().unwrap_or(conn.marker_prefix());
        let scheme = MarkerScheme::new(prefix, name)?;
        let monitor = Monitor::new(name, options.monitor.clone(), conn.metrics().clone());
        let replica = Arc::new(Replica::new());
        let live = Arc::new(AtomicBool::new(true));

        let store = conn.store();
        store.enable_expiry_notifications().await?;
        let sub = store
            .subscribe(&[name.to_string()], &[store.expired_event_pattern()])
            .await?;

        let listener = Listener {
            channel: name.to_string(),
            scheme: scheme.clone(),
            replica: replica.clone(),
            monitor: monitor.clone(),
            live: live.clone(),
        };
        let handle = tokio::spawn(listener.run(sub));
        monitor.state("subscribed");

        Ok(Collection {
            name: name.to_string(),
            conn: conn.clone(),
            scheme,
            replica,
            monitor,
            live,
            listener: Mutex::new(Some(handle)),
        })
    }

    /// 创建集合，并按配置在启动时从存储拉取一次全量快照
    pub async fn open(conn: &Connection, name: &str, options: CollectionOptions) -> Result<Self> {
        let sync_on_start = options.sync_on_start.unwrap_or(conn.sync_on_start());
        let collection = Self::new(conn, name, options).await?;
        if sync_on_start {
            collection.sync().await?;
        }
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 连接未断开且仍在接收远端变更
    pub fn is_live(&self) -> bool {
        self.conn.is_connected() && self.live.load(Ordering::SeqCst)
    }

    // --- 本地读取 ---

    pub fn get(&self, key: &str) -> Option<Value> {
        self.replica.get(key)
    }

    /// 读取并反序列化为具体类型；不存在返回 Ok(None)
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.replica.get(key) {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.replica.has(key)
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.replica.entries()
    }

    pub fn keys(&self) -> Vec<String> {
        self.replica.keys()
    }

    pub fn values(&self) -> Vec<Value> {
        self.replica.values()
    }

    pub fn len(&self) -> usize {
        self.replica.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replica.is_empty()
    }

    /// 订阅本地副本上实际生效的变更（包括远端消息和过期驱逐）
    pub fn watch(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.replica.watch()
    }

    // --- 写操作 ---

    /// 写入 key；`expire_secs` 给出时同时创建（或重置）过期标记
    pub async fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V, expire_secs: Option<u64>) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set_value(key, value, expire_secs).await
    }

    pub async fn set_value(&self, key: &str, value: Value, expire_secs: Option<u64>) -> Result<()> {
        self.ensure_live()?;
        if expire_secs == Some(0) {
            return Err(Error::InvalidTtl);
        }

        // 乐观更新：先改本地
        self.replica.insert(key, value.clone());
        Metrics::incr(&self.monitor.metrics.local_sets);
        self.record_size();

        let result = async {
            self.persist().await?;
            self.broadcast(&ChangeMessage::set(key, value)).await?;
            if let Some(secs) = expire_secs {
                let marker = self.scheme.marker_key(key);
                self.conn.store().set_with_ttl(&marker, MARKER_SENTINEL, secs).await?;
                debug!(collection = %self.name, marker = %marker, secs, "expiration marker set");
            }
            Ok::<(), Error>(())
        }
        .await;
        self.report("set", key, result)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_live()?;
        self.replica.remove(key);
        Metrics::incr(&self.monitor.metrics.local_deletes);
        self.record_size();

        let result = async {
            self.persist().await?;
            self.broadcast(&ChangeMessage::delete(key)).await
        }
        .await;
        self.report("delete", key, result)
    }

    /// 清空所有副本并删除存储中的快照（而不是写一个空对象）
    pub async fn clear(&self) -> Result<()> {
        self.ensure_live()?;
        // 本地立即清空，回显的 clear 再执行一次也无妨
        self.replica.clear();
        Metrics::incr(&self.monitor.metrics.local_clears);
        self.record_size();

        let result = async {
            self.broadcast(&ChangeMessage::Clear).await?;
            self.conn.store().delete(&self.name).await
        }
        .await;
        self.report("clear", "*", result)
    }

    /// 用存储中的快照整体覆盖本地副本。
    /// 存储中没有快照时不做任何事；读取或解码失败只记录，不向上抛出。
    pub async fn sync(&self) -> Result<()> {
        self.ensure_live()?;
        let blob = match self.conn.store().get(&self.name).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                self.monitor.info("no snapshot in store, sync skipped");
                return Ok(());
            }
            Err(e) => {
                self.sync_failed(&e.to_string());
                return Ok(());
            }
        };

        match serde_json::from_slice::<BTreeMap<String, Value>>(&blob) {
            Ok(data) => {
                let len = data.len();
                self.replica.replace_all(data);
                self.record_size();
                self.monitor.info(&format!("synced {} entries", len));
            }
            Err(e) => self.sync_failed(&format!("corrupt snapshot: {}", e)),
        }
        Ok(())
    }

    /// 停止后台监听，本地副本不再接收远端变更，之后的写操作都会失败
    pub fn close(&self) {
        self.live.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
                self.monitor.state("closed");
            }
        }
    }

    // --- 内部 ---

    fn ensure_live(&self) -> Result<()> {
        self.conn.ensure_open()?;
        if !self.live.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!(
                "collection '{}' no longer receives notifications",
                self.name
            )));
        }
        Ok(())
    }

    /// 把完整快照写回存储
    async fn persist(&self) -> Result<()> {
        let blob = serde_json::to_vec(&self.replica.snapshot())?;
        self.conn.store().set(&self.name, &blob).await
    }

    async fn broadcast(&self, msg: &ChangeMessage) -> Result<()> {
        let payload = msg.encode()?;
        self.conn.store().publish(&self.name, &payload).await
    }

    fn record_size(&self) {
        self.monitor.record_size(self.replica.len());
    }

    fn sync_failed(&self, reason: &str) {
        warn!(collection = %self.name, reason, "sync failed, keeping local replica");
        Metrics::incr(&self.monitor.metrics.sync_failures);
        self.monitor.error(&format!("sync failed: {}", reason));
    }

    fn report(&self, op: &str, key: &str, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => debug!(collection = %self.name, op, key, "write acknowledged"),
            Err(e) => self.monitor.error(&format!("{} '{}' failed, local replica diverges: {}", op, key, e)),
        }
        result
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        self.close();
        self.monitor.forget();
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("len", &self.replica.len())
            .finish()
    }
}
