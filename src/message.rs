// src/message.rs
//! 广播消息：每次本地变更（set / delete / clear）都会在集合频道上发布一条
//!
//! 线上格式为紧凑 JSON：
//! - `{"action":"set","key":"k","value":<任意 JSON>}`
//! - `{"action":"delete","key":"k"}`
//! - `{"action":"clear"}`
//!
//! 缺字段或 action 未知的消息在解码阶段直接拒绝，不会进入副本。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ChangeMessage {
    Set { key: String, value: Value },
    Delete { key: String },
    Clear,
}

impl ChangeMessage {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        ChangeMessage::Set { key: key.into(), value }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        ChangeMessage::Delete { key: key.into() }
    }

    pub fn action(&self) -> &'static str {
        match self {
            ChangeMessage::Set { .. } => "set",
            ChangeMessage::Delete { .. } => "delete",
            ChangeMessage::Clear => "clear",
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            ChangeMessage::Set { key, .. } | ChangeMessage::Delete { key } => Some(key),
            ChangeMessage::Clear => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}
