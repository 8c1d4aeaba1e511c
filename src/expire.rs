// src/expire.rs
//! 过期标记约定
//!
//! 带 TTL 的 set 会额外写入一个标记 key：`<prefix>-<集合名>-ex=<key>`，值无意义，
//! TTL 即调用方给出的秒数。标记过期时存储端发出 expired 事件，各进程据此把
//! 对应 key 从本地副本中驱逐。快照 blob 本身从不带 TTL。

use crate::error::{Error, Result};

/// 默认标记前缀，与其它实现互通时必须保持一致
pub const DEFAULT_MARKER_PREFIX: &str = "rmap";

/// 标记命名空间与真实 key 之间的分隔符
const MARKER_DELIMITER: &str = "-ex=";

/// 标记 key 的值，仅作占位
pub const MARKER_SENTINEL: &[u8] = b"1";

/// 内嵌存储发出过期事件时使用的频道
pub const EXPIRED_EVENT_CHANNEL: &str = "__keyevent@0__:expired";

/// 指定 db 的 key 过期事件频道；只订阅自己的 db，别的 db 里同名标记过期不会误伤
pub fn expired_event_channel(db: u32) -> String {
    format!("__keyevent@{}__:expired", db)
}

/// 单个集合的标记命名规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerScheme {
    prefix: String,
}

impl MarkerScheme {
    pub fn new(marker_prefix: &str, collection: &str) -> Result<Self> {
        validate_collection_name(collection)?;
        if marker_prefix.is_empty() {
            return Err(Error::Config("marker prefix must not be empty".into()));
        }
        Ok(MarkerScheme {
            prefix: format!("{}-{}{}", marker_prefix, collection, MARKER_DELIMITER),
        })
    }

    /// 该集合所有标记共享的前缀，例如 `rmap-users-ex=`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn marker_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// 从过期的标记 key 中还原真实 key；不属于本集合时返回 None。
    /// 整段剥离集合前缀而不是按第一个 `=` 切分，key 里含 `=` 也能原样还原。
    pub fn parse_marker<'a>(&self, expired: &'a str) -> Option<&'a str> {
        expired.strip_prefix(self.prefix.as_str())
    }
}

/// 集合名不能为空，也不能包含分隔符，否则某个集合的标记前缀可能成为另一个集合标记前缀的前缀
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("collection name must not be empty".into()));
    }
    if name.contains(MARKER_DELIMITER) {
        return Err(Error::Config(format!(
            "collection name '{}' must not contain '{}'",
            name, MARKER_DELIMITER
        )));
    }
    Ok(())
}
