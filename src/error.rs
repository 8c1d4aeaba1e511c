// src/error.rs
//! 错误分类：配置 / 连接 / 存储写入 / 协议 / 消息格式

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// 配置错误：store URL 缺失或非法、集合名称非法等，构造时同步抛出
    #[error("config error: {0}")]
    Config(String),

    /// 连接已关闭或不可达
    #[error("connection error: {0}")]
    Connection(String),

    /// 存储端返回错误
    #[error("store error: {0}")]
    Store(String),

    /// RESP 帧格式错误或回复形状不符
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 广播消息缺少字段或 action 未知
    #[error("malformed change message: {0}")]
    MalformedMessage(String),

    #[error("expire seconds must be greater than zero")]
    InvalidTtl,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sled(#[from] sled::Error),
}
