// src/store/resp.rs
//! RESP2 编解码
//!
//! 请求统一编码为 Array + Bulk String：
//!   *3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$1\r\nv\r\n
//! 回复支持 Simple String / Error / Integer / Bulk String / Array 五种。

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const MAX_PREALLOC: i64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    /// None 表示 `$-1`（nil）
    Bulk(Option<Vec<u8>>),
    /// None 表示 `*-1`
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// 以 UTF-8 文本形式取出 Simple / Bulk 内容
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Frame::Simple(s) => Some(s.into_bytes()),
            Frame::Bulk(b) => b,
            _ => None,
        }
    }

    /// 尝试从 buf 头部解析一个完整帧，数据不足时返回 Ok(None)，
    /// 成功时返回帧和消耗的字节数
    pub fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        let Some((line, mut used)) = read_line(buf) else {
            return Ok(None);
        };
        if line.is_empty() {
            return Err(Error::Protocol("empty frame header".into()));
        }

        let body = &line[1..];
        let frame = match line[0] {
            b'+' => Frame::Simple(utf8(body)?),
            b'-' => Frame::Error(utf8(body)?),
            b':' => Frame::Integer(parse_int(body)?),
            b'$' => {
                let len = parse_int(body)?;
                if len < 0 {
                    Frame::Bulk(None)
                } else {
                    let len = len as usize;
                    // payload + 结尾的 "\r\n"
                    if buf.len() < used + len + 2 {
                        return Ok(None);
                    }
                    let payload = buf[used..used + len].to_vec();
                    if &buf[used + len..used + len + 2] != b"\r\n" {
                        return Err(Error::Protocol("bulk string not terminated by CRLF".into()));
                    }
                    used += len + 2;
                    Frame::Bulk(Some(payload))
                }
            }
            b'*' => {
                let count = parse_int(body)?;
                if count < 0 {
                    Frame::Array(None)
                } else {
                    // 长度来自对端，预分配设上限
                    let mut items = Vec::with_capacity(count.min(MAX_PREALLOC) as usize);
                    for _ in 0..count {
                        match Frame::parse(&buf[used..])? {
                            Some((item, n)) => {
                                items.push(item);
                                used += n;
                            }
                            None => return Ok(None),
                        }
                    }
                    Frame::Array(Some(items))
                }
            }
            other => {
                return Err(Error::Protocol(format!("unknown frame type byte 0x{:02x}", other)));
            }
        };
        Ok(Some((frame, used)))
    }
}

/// 读取一行（不含 CRLF），返回行内容和包含 CRLF 的长度
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    buf.windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| (&buf[..pos], pos + 2))
}

fn utf8(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Protocol("non-utf8 line".into()))
}

fn parse_int(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid integer '{}'", String::from_utf8_lossy(raw))))
}

/// 把命令参数编码成 RESP Array
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// 从字节流中按帧读取
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader { inner, buf: Vec::with_capacity(4096) }
    }

    /// 读取下一个完整帧；对端在帧边界上关闭连接时返回 Ok(None)
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some((frame, used)) = Frame::parse(&self.buf)? {
                self.buf.drain(..used);
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Connection("connection closed in the middle of a frame".into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
