// src/collection/replica.rs
//! 本地副本：集合在本进程内的内存镜像，本地读取全部走这里
//!
//! 变更规则（与消息到达顺序一一对应，没有版本号，后到者生效）：
//! - set：覆盖写入，不做合并
//! - delete：存在则删除，不存在则无操作
//! - clear：整体清空
//! 三种操作都是幂等的，重复投递不会造成偏差。

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

use crate::message::ChangeMessage;

const WATCH_BUFFER: usize = 256;

/// 副本上每次实际生效的变更，供 watch() 订阅
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    Set { key: String },
    Deleted { key: String },
    Cleared,
    /// 过期标记触发的驱逐
    Expired { key: String },
    /// 从存储快照整体覆盖，附带覆盖后的条目数
    Synced { len: usize },
}

#[derive(Debug)]
pub struct Replica {
    data: RwLock<BTreeMap<String, Value>>,
    events: broadcast::Sender<ReplicaEvent>,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Replica { data: RwLock::new(BTreeMap::new()), events }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Value>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, event: ReplicaEvent) {
        let _ = self.events.send(event);
    }

    pub fn watch(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// 调用时刻的拷贝，不是实时视图
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.read().values().cloned().collect()
    }

    pub fn insert(&self, key: &str, value: Value) {
        self.write().insert(key.to_string(), value);
        self.notify(ReplicaEvent::Set { key: key.to_string() });
    }

    pub fn remove(&self, key: &str) -> bool {
        let existed = self.write().remove(key).is_some();
        if existed {
            self.notify(ReplicaEvent::Deleted { key: key.to_string() });
        }
        existed
    }

    /// 过期驱逐，只动本地副本
    pub fn evict(&self, key: &str) -> bool {
        let existed = self.write().remove(key).is_some();
        if existed {
            self.notify(ReplicaEvent::Expired { key: key.to_string() });
        }
        existed
    }

    pub fn clear(&self) {
        self.write().clear();
        self.notify(ReplicaEvent::Cleared);
    }

    /// 用存储快照整体替换
    pub fn replace_all(&self, data: BTreeMap<String, Value>) {
        let len = data.len();
        *self.write() = data;
        self.notify(ReplicaEvent::Synced { len });
    }

    /// 持久化用的全量快照
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.read().clone()
    }

    /// 应用一条广播消息
    pub fn apply(&self, msg: &ChangeMessage) {
        match msg {
            ChangeMessage::Set { key, value } => self.insert(key, value.clone()),
            ChangeMessage::Delete { key } => {
                self.remove(key);
            }
            ChangeMessage::Clear => self.clear(),
        }
    }
}
