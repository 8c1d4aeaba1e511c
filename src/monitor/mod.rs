// src/monitor/mod.rs
//! 监控与诊断模块
//!
//! - 可选的 monitor 回调：(事件类型, 消息, 集合名)，只用于观测，缺省时静默丢弃
//! - 所有事件同时写入 tracing 日志
//! - Metrics：按连接统计的计数器，可输出 Prometheus 文本
mod metrics;

use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

pub use metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    State,
    Info,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::State => "state",
            EventKind::Info => "info",
            EventKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// monitor 回调：(事件类型, 消息, 集合名)
pub type MonitorSink = Arc<dyn Fn(EventKind, &str, &str) + Send + Sync>;

/// 单个集合的监控出口
#[derive(Clone)]
pub struct Monitor {
    collection: String,
    /// 本地副本编号，clone 出来的 Monitor 共用
    replica: u64,
    sink: Option<MonitorSink>,
    pub metrics: Arc<Metrics>,
}

impl Monitor {
    pub fn new(collection: &str, sink: Option<MonitorSink>, metrics: Arc<Metrics>) -> Self {
        let replica = metrics.register_replica();
        Monitor { collection: collection.to_string(), replica, sink, metrics }
    }

    pub fn record_size(&self, len: usize) {
        self.metrics.record_size(&self.collection, self.replica, len);
    }

    pub fn forget(&self) {
        self.metrics.forget(&self.collection, self.replica);
    }

    pub fn emit(&self, kind: EventKind, message: &str) {
        match kind {
            EventKind::Error => error!(collection = %self.collection, "{}", message),
            _ => info!(collection = %self.collection, kind = %kind, "{}", message),
        }
        if let Some(sink) = &self.sink {
            sink(kind, message, &self.collection);
        }
    }

    pub fn state(&self, message: &str) {
        self.emit(EventKind::State, message);
    }

    pub fn info(&self, message: &str) {
        self.emit(EventKind::Info, message);
    }

    pub fn error(&self, message: &str) {
        self.emit(EventKind::Error, message);
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("collection", &self.collection)
            .field("replica", &self.replica)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
