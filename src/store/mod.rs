// src/store/mod.rs
//! 存储端抽象
//!
//! 一个存储同时承担两种角色：
//! - 命令通道：get / set / delete / 带 TTL 的 set / publish
//! - 通知通道：频道消息与按模式匹配的 key 过期事件
//!
//! 两种角色可以共用同一条底层连接（内嵌 sled 存储），也可以各占一条连接（Redis）。
pub mod embedded;
pub mod redis;
pub mod resp;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use embedded::EmbeddedStore;
pub use redis::RedisStore;

/// 通知通道上投递给订阅者的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// 直接订阅的频道上收到的消息
    Message { channel: String, payload: Vec<u8> },
    /// 模式订阅命中的消息，例如 key 过期事件（payload 为过期的 key）
    PatternMessage { pattern: String, channel: String, payload: Vec<u8> },
}

/// 一次订阅；丢弃接收端即取消订阅
pub type Subscription = mpsc::UnboundedReceiver<Notification>;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, name: &str, blob: &[u8]) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// 写入带 TTL 的 key；同名 key 会被覆盖并重新倒计时
    async fn set_with_ttl(&self, name: &str, blob: &[u8], ttl_secs: u64) -> Result<()>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// 打开 key 过期通知，重复调用无副作用
    async fn enable_expiry_notifications(&self) -> Result<()>;

    /// 本存储的 key 过期事件订阅模式，只覆盖当前使用的 db
    fn expired_event_pattern(&self) -> String;

    /// 订阅频道与模式，返回事件流
    async fn subscribe(&self, channels: &[String], patterns: &[String]) -> Result<Subscription>;

    /// 断开底层连接，之后的调用都应失败
    async fn shutdown(&self) -> Result<()>;
}

/// Redis 风格的 glob 匹配，支持 `*`、`?`、`[...]` 和 `\` 转义
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_at(&p, &t)
}

fn glob_match_at(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => {
            // 连续的 * 等价于一个
            let rest = &p[1..];
            (0..=t.len()).any(|i| glob_match_at(rest, &t[i..]))
        }
        Some('?') => !t.is_empty() && glob_match_at(&p[1..], &t[1..]),
        Some('[') => {
            let Some(c) = t.first() else { return false };
            match p.iter().position(|&x| x == ']') {
                Some(end) if end > 1 => {
                    let class = &p[1..end];
                    let (negate, class) = match class.first() {
                        Some('^') => (true, &class[1..]),
                        _ => (false, class),
                    };
                    let mut hit = false;
                    let mut i = 0;
                    while i < class.len() {
                        if i + 2 < class.len() && class[i + 1] == '-' {
                            if class[i] <= *c && *c <= class[i + 2] {
                                hit = true;
                            }
                            i += 3;
                        } else {
                            if class[i] == *c {
                                hit = true;
                            }
                            i += 1;
                        }
                    }
                    hit != negate && glob_match_at(&p[end + 1..], &t[1..])
                }
                // 没有闭合的 [ 当作普通字符
                _ => *c == '[' && glob_match_at(&p[1..], &t[1..]),
            }
        }
        Some('\\') if p.len() > 1 => {
            !t.is_empty() && t[0] == p[1] && glob_match_at(&p[2..], &t[1..])
        }
        Some(c) => !t.is_empty() && t[0] == *c && glob_match_at(&p[1..], &t[1..]),
    }
}
