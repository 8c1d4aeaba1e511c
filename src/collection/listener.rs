// src/collection/listener.rs
//! 通知通道消费者：每个集合一个后台任务
//!
//! - 集合频道上的广播消息：解码后应用到本地副本
//! - key 过期事件：只处理本集合前缀的标记，还原出真实 key 后从本地副本驱逐。
//!   驱逐不会再广播 delete，每个进程各自收到同一个过期事件。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use super::replica::Replica;
use crate::expire::MarkerScheme;
use crate::message::ChangeMessage;
use crate::monitor::{Metrics, Monitor};
use crate::store::{Notification, Subscription};

/// 日志中最多打印的非法消息字节数
const MAX_LOGGED_PAYLOAD: usize = 64;

pub(crate) struct Listener {
    pub channel: String,
    pub scheme: MarkerScheme,
    pub replica: Arc<Replica>,
    pub monitor: Monitor,
    /// 通知流仍在时为 true，集合据此拒绝写入
    pub live: Arc<AtomicBool>,
}

impl Listener {
    pub async fn run(self, mut sub: Subscription) {
        self.monitor.state("listening");
        while let Some(n) = sub.recv().await {
            self.handle(n);
        }
        self.live.store(false, Ordering::SeqCst);
        self.monitor.error("notification stream ended, replica no longer receives changes");
    }

    pub fn handle(&self, n: Notification) {
        match n {
            Notification::Message { channel, payload } if channel == self.channel => {
                self.on_change(&payload);
            }
            Notification::PatternMessage { channel, payload, .. } if channel.ends_with(":expired") => {
                self.on_expired(&payload);
            }
            other => debug!(notification = ?other, "ignored notification"),
        }
    }

    fn on_change(&self, payload: &[u8]) {
        let metrics = &self.monitor.metrics;
        match ChangeMessage::decode(payload) {
            Ok(msg) => {
                debug!(channel = %self.channel, action = msg.action(), key = ?msg.key(), "applying change");
                self.replica.apply(&msg);
                Metrics::incr(&metrics.remote_applied);
                self.monitor.record_size(self.replica.len());
            }
            Err(e) => {
                let shown = &payload[..payload.len().min(MAX_LOGGED_PAYLOAD)];
                warn!(channel = %self.channel, payload = %hex::encode(shown), error = %e, "rejected change message");
                Metrics::incr(&metrics.rejected_messages);
                self.monitor.error(&format!("rejected change message: {}", e));
            }
        }
    }

    fn on_expired(&self, payload: &[u8]) {
        let Ok(expired) = std::str::from_utf8(payload) else { return };
        let Some(key) = self.scheme.parse_marker(expired) else { return };

        // 标记已经被存储端删除，这里只清理本地副本
        if self.replica.evict(key) {
            Metrics::incr(&self.monitor.metrics.evictions);
            self.monitor.record_size(self.replica.len());
            self.monitor.info(&format!("key '{}' expired", key));
        } else {
            debug!(key, "expired key was not present locally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expire::EXPIRED_EVENT_CHANNEL;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn make_listener() -> Listener {
        Listener {
            channel: "users".into(),
            scheme: MarkerScheme::new("rmap", "users").unwrap(),
            replica: Arc::new(Replica::new()),
            monitor: Monitor::new("users", None, Arc::new(Metrics::new())),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    fn message(channel: &str, msg: &ChangeMessage) -> Notification {
        Notification::Message { channel: channel.into(), payload: msg.encode().unwrap() }
    }

    fn expired(key: &str) -> Notification {
        Notification::PatternMessage {
            pattern: EXPIRED_EVENT_CHANNEL.into(),
            channel: EXPIRED_EVENT_CHANNEL.into(),
            payload: key.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_applies_change_messages() {
        let l = make_listener();
        l.handle(message("users", &ChangeMessage::set("p1", json!({"plan": "pro"}))));
        assert_eq!(l.replica.get("p1"), Some(json!({"plan": "pro"})));
        l.handle(message("users", &ChangeMessage::delete("p1")));
        assert!(!l.replica.has("p1"));
        assert_eq!(l.monitor.metrics.remote_applied.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_ignores_other_channels() {
        let l = make_listener();
        l.handle(message("sessions", &ChangeMessage::set("p1", json!(1))));
        assert!(l.replica.is_empty());
    }

    #[test]
    fn test_rejects_malformed_messages() {
        let l = make_listener();
        l.replica.insert("keep", json!(1));
        l.handle(Notification::Message { channel: "users".into(), payload: br#"{"action":"set"}"#.to_vec() });
        l.handle(Notification::Message { channel: "users".into(), payload: b"garbage".to_vec() });
        assert_eq!(l.replica.entries(), vec![("keep".to_string(), json!(1))]);
        assert_eq!(l.monitor.metrics.rejected_messages.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_evicts_on_own_marker_only() {
        let l = make_listener();
        l.replica.insert("p1", json!(1));
        l.replica.insert("a=b", json!(2));

        l.handle(expired("rmap-sessions-ex=p1"));
        l.handle(expired("p1"));
        assert!(l.replica.has("p1"));

        l.handle(expired("rmap-users-ex=p1"));
        assert!(!l.replica.has("p1"));
        l.handle(expired("rmap-users-ex=a=b"));
        assert!(l.replica.is_empty());
        assert_eq!(l.monitor.metrics.evictions.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_run_until_stream_closes() {
        let l = make_listener();
        let replica = l.replica.clone();
        let live = l.live.clone();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(l.run(rx));
        tx.send(message("users", &ChangeMessage::set("a", json!(1)))).unwrap();
        tx.send(message("users", &ChangeMessage::Clear)).unwrap();
        tx.send(message("users", &ChangeMessage::set("b", json!(2)))).unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(replica.entries(), vec![("b".to_string(), json!(2))]);
        assert!(!live.load(Ordering::SeqCst));
    }
}
