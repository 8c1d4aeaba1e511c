// src/lib.rs
//! rmap 库：多进程复制的 key-value 映射
//!
//! config / error / message / expire / store / connection / monitor / collection

pub mod config;      // 配置文件 & 存储地址
pub mod error;       // 错误分类
pub mod message;     // 广播消息编解码
pub mod expire;      // 过期标记约定
pub mod store;       // 存储抽象：sled 内嵌 / Redis
pub mod connection;  // 共享连接
pub mod monitor;     // 监控 & 诊断
pub mod collection;  // 集合：本地副本 + 同步 + 过期驱逐

pub use collection::{Collection, CollectionOptions, ReplicaEvent};
pub use config::Config;
pub use connection::Connection;
pub use error::{Error, Result};
pub use message::ChangeMessage;
pub use monitor::{EventKind, MonitorSink};
