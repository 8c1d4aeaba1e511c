// src/store/embedded.rs
//! 内嵌存储：基于 sled 的单机共享存储
//!
//! - 主 data tree 保存 blob
//! - "expire" tree 保存 key -> 过期时间戳（UNIX 毫秒，大端）
//! - 读时惰性过期 + 后台定时扫描，两者命中时都会发出 key 过期事件
//! - 进程内 pub/sub 用 tokio broadcast 实现，同一个 EmbeddedStore 上的所有集合都能收到
//!
//! 同一进程中多个 Connection 共享一个 EmbeddedStore，就相当于多个进程连到同一个 Redis。

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{debug, warn};

use super::{Notification, Store, Subscription, glob_match};
use crate::error::{Error, Result};
use crate::expire::EXPIRED_EVENT_CHANNEL;

const EXPIRE_TREE: &str = "expire";
const EVENT_BUFFER: usize = 1024;

/// 返回当前的 UNIX 毫秒
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 频道名 + 消息体
type Event = (String, Vec<u8>);

struct Shared {
    db: Db,
    expire: Tree,
    events: broadcast::Sender<Event>,
    notify_expired: AtomicBool,
}

impl Shared {
    fn new(db: Db) -> Result<Self> {
        let expire = db.open_tree(EXPIRE_TREE)?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Shared { db, expire, events, notify_expired: AtomicBool::new(false) })
    }

    fn emit(&self, channel: &str, payload: Vec<u8>) {
        // 没有订阅者时 send 会失败，与 Redis PUBLISH 返回 0 等价
        let _ = self.events.send((channel.to_string(), payload));
    }

    /// 删除 key 的数据和过期记录，仅当过期时间仍为 `deadline` 时才生效
    fn evict(&self, key: &[u8], deadline: &[u8]) -> Result<bool> {
        // CAS：扫描期间 key 被重新设置了 TTL 就不能删
        match self.expire.compare_and_swap(key, Some(deadline), None::<&[u8]>)? {
            Ok(()) => {
                self.db.remove(key)?;
                if self.notify_expired.load(Ordering::SeqCst) {
                    self.emit(EXPIRED_EVENT_CHANNEL, key.to_vec());
                }
                Ok(true)
            }
            Err(_cas_err) => Ok(false),
        }
    }

    /// 检查 key 是否过期，是则删除并发出过期事件
    fn remove_if_expired(&self, key: &str) -> Result<()> {
        if let Some(ivec) = self.expire.get(key.as_bytes())? {
            if decode_deadline(&ivec) <= now_ms() {
                self.evict(key.as_bytes(), &ivec)?;
            }
        }
        Ok(())
    }

    /// 扫描整棵 expire tree，清理所有到期 key，返回清理数量
    fn sweep(&self) -> Result<usize> {
        let now = now_ms();
        let mut due = Vec::new();
        for entry in self.expire.iter() {
            let (k, v) = entry?;
            if decode_deadline(&v) <= now {
                due.push((k, v));
            }
        }
        let mut removed = 0;
        for (k, v) in due {
            if self.evict(&k, &v)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn decode_deadline(raw: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    let n = raw.len().min(8);
    b[..n].copy_from_slice(&raw[..n]);
    u64::from_be_bytes(b)
}

pub struct EmbeddedStore {
    shared: Arc<Shared>,
    open: AtomicBool,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddedStore {
    /// 打开（或创建）指定目录下的持久化存储
    pub fn open<P: AsRef<Path>>(path: P, scan_interval: Duration) -> Result<Self> {
        let db = sled::open(path)?;
        Self::with_db(db, scan_interval)
    }

    /// 临时存储，进程退出即丢弃
    pub fn temporary(scan_interval: Duration) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, scan_interval)
    }

    /// 必须在 tokio runtime 内调用：会启动后台过期扫描任务
    pub fn with_db(db: Db, scan_interval: Duration) -> Result<Self> {
        let shared = Arc::new(Shared::new(db)?);
        let cleaner = tokio::spawn(start_cleaner(Arc::downgrade(&shared), scan_interval));
        Ok(EmbeddedStore {
            shared,
            open: AtomicBool::new(true),
            cleaner: Mutex::new(Some(cleaner)),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connection("embedded store is closed".into()))
        }
    }

    fn stop_cleaner(&self) {
        if let Ok(mut guard) = self.cleaner.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for EmbeddedStore {
    fn drop(&mut self) {
        self.stop_cleaner();
    }
}

/// 后台定时清理任务，存储被释放后自动退出
async fn start_cleaner(shared: Weak<Shared>, every: Duration) {
    let mut iv = interval(every);
    loop {
        iv.tick().await;
        let Some(shared) = shared.upgrade() else { break };
        match shared.sweep() {
            Ok(0) => {}
            Ok(n) => debug!(removed = n, "expired keys swept"),
            Err(e) => warn!(error = %e, "expire sweep failed"),
        }
    }
}

#[async_trait]
impl Store for EmbeddedStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        // 惰性过期
        self.shared.remove_if_expired(name)?;
        Ok(self.shared.db.get(name.as_bytes())?.map(|ivec| ivec.to_vec()))
    }

    async fn set(&self, name: &str, blob: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.shared.db.insert(name.as_bytes(), blob)?;
        // 普通 SET 会清除原有 TTL
        self.shared.expire.remove(name.as_bytes())?;
        self.shared.db.flush()?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared.db.remove(name.as_bytes())?;
        self.shared.expire.remove(name.as_bytes())?;
        self.shared.db.flush()?;
        Ok(())
    }

    async fn set_with_ttl(&self, name: &str, blob: &[u8], ttl_secs: u64) -> Result<()> {
        self.ensure_open()?;
        if ttl_secs == 0 {
            return Err(Error::InvalidTtl);
        }
        let deadline = now_ms().saturating_add(ttl_secs.saturating_mul(1000));
        self.shared.db.insert(name.as_bytes(), blob)?;
        self.shared.expire.insert(name.as_bytes(), &deadline.to_be_bytes()[..])?;
        self.shared.db.flush()?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.shared.emit(channel, payload.to_vec());
        Ok(())
    }

    async fn enable_expiry_notifications(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.notify_expired.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn expired_event_pattern(&self) -> String {
        EXPIRED_EVENT_CHANNEL.to_string()
    }

    async fn subscribe(&self, channels: &[String], patterns: &[String]) -> Result<Subscription> {
        self.ensure_open()?;
        let mut events = self.shared.events.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let channels = channels.to_vec();
        let patterns = patterns.to_vec();

        tokio::spawn(async move {
            loop {
                let (channel, payload) = tokio::select! {
                    _ = tx.closed() => break,
                    recv = events.recv() => match recv {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "subscriber lagged, notifications dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if channels.iter().any(|c| *c == channel) {
                    let n = Notification::Message { channel: channel.clone(), payload: payload.clone() };
                    if tx.send(n).is_err() {
                        break;
                    }
                }
                for pattern in patterns.iter().filter(|p| glob_match(p, &channel)) {
                    let n = Notification::PatternMessage {
                        pattern: pattern.clone(),
                        channel: channel.clone(),
                        payload: payload.clone(),
                    };
                    if tx.send(n).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn shutdown(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.stop_cleaner();
            self.shared.db.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn make_store() -> EmbeddedStore {
        EmbeddedStore::temporary(Duration::from_millis(20)).expect("打开临时 sled db 失败")
    }

    #[tokio::test]
    async fn test_get_set_delete() -> anyhow::Result<()> {
        let store = make_store();
        assert_eq!(store.get("users").await?, None);
        store.set("users", b"{}").await?;
        assert_eq!(store.get("users").await?, Some(b"{}".to_vec()));
        store.delete("users").await?;
        assert_eq!(store.get("users").await?, None);
        // 删除不存在的 key 不报错
        store.delete("users").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_ttl_expires_lazily_and_notifies() -> anyhow::Result<()> {
        // 扫描间隔很长，只能靠惰性过期
        let store = EmbeddedStore::temporary(Duration::from_secs(3600))?;
        store.enable_expiry_notifications().await?;
        assert_eq!(store.expired_event_pattern(), EXPIRED_EVENT_CHANNEL);
        let mut sub = store.subscribe(&[], &["__keyevent@*__:expired".to_string()]).await?;

        store.set_with_ttl("marker", b"1", 1).await?;
        assert!(store.get("marker").await?.is_some());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.get("marker").await?, None);

        let n = timeout(Duration::from_secs(1), sub.recv()).await?;
        assert_eq!(
            n,
            Some(Notification::PatternMessage {
                pattern: "__keyevent@*__:expired".into(),
                channel: EXPIRED_EVENT_CHANNEL.into(),
                payload: b"marker".to_vec(),
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_background_sweep() -> anyhow::Result<()> {
        let store = make_store();
        store.enable_expiry_notifications().await?;
        let mut sub = store.subscribe(&[], &["__keyevent@*__:expired".to_string()]).await?;
        store.set_with_ttl("m1", b"1", 1).await?;

        // 不调用 get，后台扫描也应发出事件
        let n = timeout(Duration::from_secs(3), sub.recv()).await?;
        match n {
            Some(Notification::PatternMessage { payload, .. }) => assert_eq!(payload, b"m1".to_vec()),
            other => panic!("unexpected notification {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_no_expiry_event_until_enabled() -> anyhow::Result<()> {
        let store = make_store();
        let mut sub = store.subscribe(&[], &["*".to_string()]).await?;
        store.set_with_ttl("m1", b"1", 1).await?;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(store.get("m1").await?, None);
        assert!(sub.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_ttl_restarts_countdown() -> anyhow::Result<()> {
        let store = make_store();
        store.set_with_ttl("m", b"1", 1).await?;
        tokio::time::sleep(Duration::from_millis(600)).await;
        store.set_with_ttl("m", b"1", 2).await?;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.get("m").await?.is_some());

        // 普通 set 会去掉 TTL
        store.set("m", b"2").await?;
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(store.get("m").await?, Some(b"2".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_subscribe() -> anyhow::Result<()> {
        let store = make_store();
        let mut a = store.subscribe(&["users".to_string()], &[]).await?;
        let mut b = store.subscribe(&["users".to_string()], &[]).await?;
        let mut other = store.subscribe(&["sessions".to_string()], &[]).await?;

        store.publish("users", b"hello").await?;
        let expected = Notification::Message { channel: "users".into(), payload: b"hello".to_vec() };
        assert_eq!(timeout(Duration::from_secs(1), a.recv()).await?, Some(expected.clone()));
        assert_eq!(timeout(Duration::from_secs(1), b.recv()).await?, Some(expected));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(other.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() -> anyhow::Result<()> {
        let store = make_store();
        store.shutdown().await?;
        assert!(matches!(store.get("x").await, Err(Error::Connection(_))));
        assert!(matches!(store.publish("c", b"p").await, Err(Error::Connection(_))));
        // 重复关闭无副作用
        store.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_persistent_reopen() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        {
            let store = EmbeddedStore::open(tmp.path().join("db"), Duration::from_millis(50))?;
            store.set("users", br#"{"a":1}"#).await?;
            store.shutdown().await?;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let store = EmbeddedStore::open(tmp.path().join("db"), Duration::from_millis(50))?;
        assert_eq!(store.get("users").await?, Some(br#"{"a":1}"#.to_vec()));
        Ok(())
    }
}
