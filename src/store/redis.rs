// src/store/redis.rs
//! Redis 存储：两条 TCP 连接
//!
//! - 命令连接：GET / SET / DEL / PUBLISH / CONFIG。连接由一个后台任务独占，
//!   请求经 mpsc 排队，回复经 oneshot 送回；调用方中途放弃等待时，任务仍会把回复读完，
//!   连接不会错位。连接出错即丢弃，下一条命令重新连接并重新 SELECT。
//! - 通知连接：每次 subscribe 单独建立，进入订阅模式后只能收消息，
//!   所以不能与命令连接共用

use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::resp::{Frame, FrameReader, encode_command};
use super::{Notification, Store, Subscription};
use crate::error::{Error, Result};
use crate::expire::expired_event_channel;

const NOTIFY_CONFIG_KEY: &str = "notify-keyspace-events";

enum Request {
    Command { payload: Vec<u8>, reply: oneshot::Sender<Result<Frame>> },
    Quit { done: oneshot::Sender<()> },
}

struct CommandConn {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl CommandConn {
    /// 建立命令连接，db 不为 0 时先 SELECT
    async fn open(addr: &str, db: u32) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", addr, e)))?;
        let (r, w) = stream.into_split();
        let mut conn = CommandConn { reader: FrameReader::new(r), writer: w };
        if db != 0 {
            let db = db.to_string();
            match conn.exchange(&encode_command(&[b"SELECT", db.as_bytes()])).await? {
                Frame::Error(msg) => return Err(Error::Store(msg)),
                frame => expect_ok(frame)?,
            }
        }
        Ok(conn)
    }

    async fn exchange(&mut self, payload: &[u8]) -> Result<Frame> {
        self.writer.write_all(payload).await?;
        self.reader
            .next_frame()
            .await?
            .ok_or_else(|| Error::Connection("redis closed the connection".into()))
    }
}

/// 独占命令连接的后台任务，一次只处理一个请求
async fn run_commands(
    addr: String,
    db: u32,
    mut conn: Option<CommandConn>,
    mut requests: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            Request::Command { payload, reply } => {
                if conn.is_none() {
                    match CommandConn::open(&addr, db).await {
                        Ok(c) => {
                            info!(addr = %addr, db, "reconnected to redis");
                            conn = Some(c);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            continue;
                        }
                    }
                }
                let Some(c) = conn.as_mut() else { continue };
                let result = match c.exchange(&payload).await {
                    Ok(Frame::Error(msg)) => Err(Error::Store(msg)),
                    Ok(frame) => Ok(frame),
                    Err(e) => {
                        // 出错后连接状态未知，整条丢弃
                        warn!(addr = %addr, error = %e, "command connection dropped");
                        conn = None;
                        Err(e)
                    }
                };
                // 调用方可能已经不等了，回复照样读完再丢掉
                let _ = reply.send(result);
            }
            Request::Quit { done } => {
                if let Some(mut c) = conn.take() {
                    // QUIT 失败不影响关闭
                    let _ = c.writer.write_all(&encode_command(&[b"QUIT"])).await;
                    let _ = c.writer.shutdown().await;
                }
                let _ = done.send(());
                break;
            }
        }
    }
    debug!(addr = %addr, "command task finished");
}

pub struct RedisStore {
    addr: String,
    db: u32,
    requests: mpsc::UnboundedSender<Request>,
    closed: AtomicBool,
    notify_enabled: OnceCell<()>,
    subscribers: StdMutex<Vec<JoinHandle<()>>>,
}

impl RedisStore {
    pub async fn connect(host: &str, port: u16, db: u32) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let conn = CommandConn::open(&addr, db).await?;
        let (requests, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_commands(addr.clone(), db, Some(conn), rx));
        info!(addr = %addr, db, "connected to redis");
        Ok(RedisStore {
            addr,
            db,
            requests,
            closed: AtomicBool::new(false),
            notify_enabled: OnceCell::new(),
            subscribers: StdMutex::new(Vec::new()),
        })
    }

    fn closed_error(&self) -> Error {
        Error::Connection(format!("connection to {} is closed", self.addr))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// 在命令连接上执行一条命令并等待回复；错误回复转为 Error::Store
    async fn command(&self, args: &[&[u8]]) -> Result<Frame> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Command { payload: encode_command(args), reply })
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }
}

fn expect_ok(frame: Frame) -> Result<()> {
    match frame {
        Frame::Simple(ref s) if s == "OK" => Ok(()),
        other => Err(Error::Protocol(format!("expected +OK, got {:?}", other))),
    }
}

/// 在已有的 notify-keyspace-events 标志上补齐 E（keyevent）和 x（expired）
fn merge_notify_flags(current: &str) -> Option<String> {
    let has_event = current.contains('E');
    let has_expired = current.contains('x') || current.contains('A');
    if has_event && has_expired {
        return None;
    }
    let mut flags = current.to_string();
    if !has_event {
        flags.push('E');
    }
    if !has_expired {
        flags.push('x');
    }
    Some(flags)
}

/// 订阅连接上一帧的类型：message / pmessage / subscribe / psubscribe ...
fn push_kind(frame: &Frame) -> Option<&str> {
    match frame {
        Frame::Array(Some(items)) => items.first()?.as_text(),
        _ => None,
    }
}

/// 把订阅连接上的一帧转换为 Notification；订阅确认等其它帧返回 None
fn decode_push(frame: Frame) -> Option<Notification> {
    let Frame::Array(Some(items)) = frame else { return None };
    let mut items = items.into_iter();
    let kind = items.next()?;
    match kind.as_text()? {
        "message" => {
            let channel = items.next()?.as_text()?.to_string();
            let payload = items.next()?.into_bytes()?;
            Some(Notification::Message { channel, payload })
        }
        "pmessage" => {
            let pattern = items.next()?.as_text()?.to_string();
            let channel = items.next()?.as_text()?.to_string();
            let payload = items.next()?.into_bytes()?;
            Some(Notification::PatternMessage { pattern, channel, payload })
        }
        _ => None,
    }
}

/// 读到每个频道和模式的订阅确认为止，期间先到的消息暂存起来
async fn await_confirmations(
    reader: &mut FrameReader<OwnedReadHalf>,
    mut channels: usize,
    mut patterns: usize,
) -> Result<Vec<Notification>> {
    let mut early = Vec::new();
    while channels + patterns > 0 {
        let frame = reader
            .next_frame()
            .await?
            .ok_or_else(|| Error::Connection("notification connection closed before subscribing".into()))?;
        let kind = push_kind(&frame);
        if kind == Some("subscribe") {
            channels = channels.saturating_sub(1);
        } else if kind == Some("psubscribe") {
            patterns = patterns.saturating_sub(1);
        } else if let Frame::Error(msg) = frame {
            return Err(Error::Store(msg));
        } else {
            early.extend(decode_push(frame));
        }
    }
    Ok(early)
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.command(&[b"GET", name.as_bytes()]).await? {
            Frame::Bulk(b) => Ok(b),
            other => Err(Error::Protocol(format!("unexpected GET reply {:?}", other))),
        }
    }

    async fn set(&self, name: &str, blob: &[u8]) -> Result<()> {
        expect_ok(self.command(&[b"SET", name.as_bytes(), blob]).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.command(&[b"DEL", name.as_bytes()]).await? {
            Frame::Integer(_) => Ok(()),
            other => Err(Error::Protocol(format!("unexpected DEL reply {:?}", other))),
        }
    }

    async fn set_with_ttl(&self, name: &str, blob: &[u8], ttl_secs: u64) -> Result<()> {
        if ttl_secs == 0 {
            return Err(Error::InvalidTtl);
        }
        let ttl = ttl_secs.to_string();
        expect_ok(self.command(&[b"SET", name.as_bytes(), blob, b"EX", ttl.as_bytes()]).await?)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        match self.command(&[b"PUBLISH", channel.as_bytes(), payload]).await? {
            Frame::Integer(receivers) => {
                debug!(channel, receivers, "published");
                Ok(())
            }
            other => Err(Error::Protocol(format!("unexpected PUBLISH reply {:?}", other))),
        }
    }

    async fn enable_expiry_notifications(&self) -> Result<()> {
        // 每条共享连接只做一次
        self.notify_enabled
            .get_or_try_init(|| async {
                let reply = self.command(&[b"CONFIG", b"GET", NOTIFY_CONFIG_KEY.as_bytes()]).await?;
                let current = match reply {
                    Frame::Array(Some(items)) => items
                        .get(1)
                        .and_then(|f| f.as_text())
                        .unwrap_or_default()
                        .to_string(),
                    _ => String::new(),
                };
                if let Some(flags) = merge_notify_flags(&current) {
                    expect_ok(
                        self.command(&[b"CONFIG", b"SET", NOTIFY_CONFIG_KEY.as_bytes(), flags.as_bytes()])
                            .await?,
                    )?;
                    info!(flags = %flags, "enabled expired-key notifications");
                }
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    fn expired_event_pattern(&self) -> String {
        expired_event_channel(self.db)
    }

    async fn subscribe(&self, channels: &[String], patterns: &[String]) -> Result<Subscription> {
        self.ensure_open()?;

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", self.addr, e)))?;
        let (r, mut w) = stream.into_split();
        let mut reader = FrameReader::new(r);

        if !channels.is_empty() {
            let mut args: Vec<&[u8]> = vec![b"SUBSCRIBE".as_slice()];
            args.extend(channels.iter().map(|c| c.as_bytes()));
            w.write_all(&encode_command(&args)).await?;
        }
        if !patterns.is_empty() {
            let mut args: Vec<&[u8]> = vec![b"PSUBSCRIBE".as_slice()];
            args.extend(patterns.iter().map(|p| p.as_bytes()));
            w.write_all(&encode_command(&args)).await?;
        }
        // 订阅全部生效后才返回，之后读快照不会漏掉中间发布的变更
        let early = await_confirmations(&mut reader, channels.len(), patterns.len()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        for n in early {
            let _ = tx.send(n);
        }
        let addr = self.addr.clone();
        let db = self.db;
        let handle = tokio::spawn(async move {
            // 写半边要活到任务结束，否则连接会被半关闭
            let _writer = w;
            loop {
                let frame = tokio::select! {
                    _ = tx.closed() => break,
                    frame = reader.next_frame() => frame,
                };
                match frame {
                    Ok(Some(frame)) => {
                        if let Some(n) = decode_push(frame) {
                            if tx.send(n).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!(addr = %addr, db, "notification connection closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!(addr = %addr, db, error = %e, "notification connection failed");
                        break;
                    }
                }
            }
            // tx 在此释放，订阅方随即收到流结束
        });

        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|h| !h.is_finished());
            subs.push(handle);
        }
        Ok(rx)
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut subs) = self.subscribers.lock() {
            for h in subs.drain(..) {
                h.abort();
            }
        }
        let (done, rx) = oneshot::channel();
        if self.requests.send(Request::Quit { done }).is_ok() {
            let _ = rx.await;
        }
        info!(addr = %self.addr, "disconnected from redis");
        Ok(())
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            for h in subs.drain(..) {
                h.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::{Mutex, watch};
    use tokio::time::{Duration, timeout};

    #[test]
    fn test_merge_notify_flags() {
        assert_eq!(merge_notify_flags(""), Some("Ex".to_string()));
        assert_eq!(merge_notify_flags("Kg"), Some("KgEx".to_string()));
        assert_eq!(merge_notify_flags("Ex"), None);
        assert_eq!(merge_notify_flags("KEA"), None);
        assert_eq!(merge_notify_flags("x"), Some("xE".to_string()));
    }

    #[test]
    fn test_decode_push() {
        let bulk = |s: &str| Frame::Bulk(Some(s.as_bytes().to_vec()));
        let msg = Frame::Array(Some(vec![bulk("message"), bulk("users"), bulk("{}")]));
        assert_eq!(
            decode_push(msg),
            Some(Notification::Message { channel: "users".into(), payload: b"{}".to_vec() })
        );
        let confirm = Frame::Array(Some(vec![bulk("subscribe"), bulk("users"), Frame::Integer(1)]));
        assert_eq!(push_kind(&confirm), Some("subscribe"));
        assert_eq!(decode_push(confirm), None);
        assert_eq!(decode_push(Frame::Simple("OK".into())), None);
    }

    /// 极简的假 Redis：只实现本库用到的命令
    ///
    /// 额外的测试命令：BADFRAME 回一个非法帧，DROP 不回复直接断开。
    /// 订阅名为 "unconfirmed" 的频道时不发确认。kill 置 true 后断开所有订阅连接。
    struct FakeRedis {
        data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
        log: Mutex<Vec<Vec<String>>>,
        notify_flags: Mutex<String>,
        kill: watch::Sender<bool>,
    }

    async fn spawn_fake_redis() -> anyhow::Result<(String, u16, Arc<FakeRedis>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(FakeRedis {
            data: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            notify_flags: Mutex::new(String::new()),
            kill: watch::channel(false).0,
        });
        let server_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let state = server_state.clone();
                tokio::spawn(async move {
                    let _ = serve_fake(stream, state).await;
                });
            }
        });
        Ok(("127.0.0.1".to_string(), port, state))
    }

    fn bulk_reply(v: &[u8]) -> Vec<u8> {
        let mut out = format!("${}\r\n", v.len()).into_bytes();
        out.extend_from_slice(v);
        out.extend_from_slice(b"\r\n");
        out
    }

    async fn serve_fake(stream: TcpStream, state: Arc<FakeRedis>) -> Result<()> {
        let (r, mut w) = stream.into_split();
        let mut reader = FrameReader::new(r);
        let mut kill = state.kill.subscribe();
        let mut subscribed = false;
        loop {
            let frame = tokio::select! {
                frame = reader.next_frame() => frame?,
                _ = kill.wait_for(|k| *k), if subscribed => return Ok(()),
            };
            let Some(frame) = frame else { break };
            let Frame::Array(Some(items)) = frame else { continue };
            let args: Vec<Vec<u8>> = items.into_iter().filter_map(|f| f.into_bytes()).collect();
            let text: Vec<String> = args.iter().map(|a| String::from_utf8_lossy(a).to_string()).collect();
            state.log.lock().await.push(text.clone());

            let reply: Vec<u8> = match text[0].to_uppercase().as_str() {
                "SELECT" => b"+OK\r\n".to_vec(),
                "GET" => match state.data.lock().await.get(&args[1]) {
                    Some(v) => bulk_reply(v),
                    None => b"$-1\r\n".to_vec(),
                },
                "SET" => {
                    state.data.lock().await.insert(args[1].clone(), args[2].clone());
                    b"+OK\r\n".to_vec()
                }
                "DEL" => {
                    let n = state.data.lock().await.remove(&args[1]).map_or(0, |_| 1);
                    format!(":{}\r\n", n).into_bytes()
                }
                "PUBLISH" => b":0\r\n".to_vec(),
                "CONFIG" if text[1] == "GET" => {
                    let flags = state.notify_flags.lock().await.clone();
                    encode_command(&[text[2].as_bytes(), flags.as_bytes()])
                }
                "CONFIG" => {
                    *state.notify_flags.lock().await = text[3].clone();
                    b"+OK\r\n".to_vec()
                }
                "BADFRAME" => b"!oops\r\n".to_vec(),
                "DROP" => return Ok(()),
                "PSUBSCRIBE" => {
                    subscribed = true;
                    let mut out = Vec::new();
                    for pattern in &args[1..] {
                        // 订阅确认的第三项本应是整数，这里省略
                        out.extend(encode_command(&[b"psubscribe", pattern.as_slice()]));
                    }
                    out.extend(encode_command(&[
                        b"pmessage",
                        args[1].as_slice(),
                        b"__keyevent@0__:expired",
                        b"rmap-users-ex=p1",
                    ]));
                    out
                }
                "SUBSCRIBE" if text[1] == "unconfirmed" => Vec::new(),
                "SUBSCRIBE" => {
                    subscribed = true;
                    let mut out = Vec::new();
                    for channel in &args[1..] {
                        out.extend(encode_command(&[b"subscribe", channel.as_slice()]));
                    }
                    // 确认之间夹一条消息，客户端要先暂存
                    out.extend(encode_command(&[b"message", args[1].as_slice(), br#"{"action":"clear"}"#]));
                    out
                }
                "QUIT" => {
                    w.write_all(b"+OK\r\n").await?;
                    return Ok(());
                }
                other => format!("-ERR unknown command '{}'\r\n", other).into_bytes(),
            };
            w.write_all(&reply).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_commands_against_fake_server() -> anyhow::Result<()> {
        let (host, port, state) = spawn_fake_redis().await?;
        let store = RedisStore::connect(&host, port, 3).await?;

        assert_eq!(store.get("users").await?, None);
        store.set("users", br#"{"a":1}"#).await?;
        assert_eq!(store.get("users").await?, Some(br#"{"a":1}"#.to_vec()));
        store.set_with_ttl("rmap-users-ex=a", b"1", 5).await?;
        store.publish("users", b"{}").await?;
        store.delete("users").await?;
        assert_eq!(store.get("users").await?, None);
        assert!(matches!(store.set_with_ttl("m", b"1", 0).await, Err(Error::InvalidTtl)));

        let log = state.log.lock().await.clone();
        assert_eq!(log[0], vec!["SELECT", "3"]);
        assert!(log.contains(&vec![
            "SET".to_string(),
            "rmap-users-ex=a".to_string(),
            "1".to_string(),
            "EX".to_string(),
            "5".to_string()
        ]));

        store.shutdown().await?;
        assert!(matches!(store.get("users").await, Err(Error::Connection(_))));
        // 重复关闭无副作用
        store.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_command_does_not_shift_replies() -> anyhow::Result<()> {
        let (host, port, _state) = spawn_fake_redis().await?;
        let store = RedisStore::connect(&host, port, 0).await?;
        store.set("users", br#"{"a":1}"#).await?;

        // 发出 GET 后立刻放弃等待
        for _ in 0..10 {
            let pending = store.get("users");
            tokio::pin!(pending);
            tokio::select! {
                biased;
                _ = &mut pending => {}
                _ = tokio::task::yield_now() => {}
            }
        }
        assert_eq!(store.get("no-such-key").await?, None);
        assert_eq!(store.get("users").await?, Some(br#"{"a":1}"#.to_vec()));

        let timed_out = timeout(Duration::from_nanos(1), store.get("users")).await;
        drop(timed_out);
        assert_eq!(store.get("no-such-key").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_connection_is_replaced() -> anyhow::Result<()> {
        let (host, port, state) = spawn_fake_redis().await?;
        let store = RedisStore::connect(&host, port, 3).await?;
        store.set("users", b"{}").await?;

        // 非法帧：协议错误，连接被丢弃
        assert!(matches!(store.command(&[b"BADFRAME"]).await, Err(Error::Protocol(_))));
        assert_eq!(store.get("users").await?, Some(b"{}".to_vec()));

        // 服务端直接断开：连接错误，下一条命令重连
        assert!(matches!(store.command(&[b"DROP"]).await, Err(Error::Connection(_))));
        assert_eq!(store.get("users").await?, Some(b"{}".to_vec()));

        // 每次重连都重新 SELECT
        let selects = state.log.lock().await.iter().filter(|c| c[0] == "SELECT").count();
        assert_eq!(selects, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_enable_notifications_once() -> anyhow::Result<()> {
        let (host, port, state) = spawn_fake_redis().await?;
        let store = RedisStore::connect(&host, port, 0).await?;
        store.enable_expiry_notifications().await?;
        store.enable_expiry_notifications().await?;
        assert_eq!(*state.notify_flags.lock().await, "Ex");

        let config_calls = state
            .log
            .lock()
            .await
            .iter()
            .filter(|c| c[0] == "CONFIG")
            .count();
        assert_eq!(config_calls, 2, "只应有一次 CONFIG GET 和一次 CONFIG SET");
        Ok(())
    }

    #[tokio::test]
    async fn test_error_reply_maps_to_store_error() -> anyhow::Result<()> {
        let (host, port, _state) = spawn_fake_redis().await?;
        let store = RedisStore::connect(&host, port, 0).await?;
        let err = store.command(&[b"FLUSHALL"]).await.unwrap_err();
        assert!(matches!(err, Error::Store(ref m) if m.contains("unknown command")));
        // 错误回复不影响连接
        store.set("users", b"{}").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_pattern_follows_db() -> anyhow::Result<()> {
        let (host, port, _state) = spawn_fake_redis().await?;
        let store = RedisStore::connect(&host, port, 3).await?;
        assert_eq!(store.expired_event_pattern(), "__keyevent@3__:expired");
        let store = RedisStore::connect(&host, port, 0).await?;
        assert_eq!(store.expired_event_pattern(), "__keyevent@0__:expired");
        Ok(())
    }

    #[tokio::test]
    async fn test_subscribe_uses_separate_connection() -> anyhow::Result<()> {
        let (host, port, _state) = spawn_fake_redis().await?;
        let store = RedisStore::connect(&host, port, 0).await?;
        let pattern = store.expired_event_pattern();
        let mut sub = store.subscribe(&["users".to_string()], &[pattern.clone()]).await?;

        let mut got = Vec::new();
        for _ in 0..2 {
            got.push(timeout(Duration::from_secs(2), sub.recv()).await?.expect("notification"));
        }
        // 确认之前到达的消息排在最前面
        assert_eq!(
            got[0],
            Notification::Message { channel: "users".into(), payload: br#"{"action":"clear"}"#.to_vec() }
        );
        assert_eq!(
            got[1],
            Notification::PatternMessage {
                pattern,
                channel: "__keyevent@0__:expired".into(),
                payload: b"rmap-users-ex=p1".to_vec(),
            }
        );

        // 订阅期间命令连接仍然可用
        store.set("users", b"{}").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_subscribe_waits_for_confirmation() -> anyhow::Result<()> {
        let (host, port, _state) = spawn_fake_redis().await?;
        let store = RedisStore::connect(&host, port, 0).await?;
        let pending = timeout(Duration::from_millis(200), store.subscribe(&["unconfirmed".to_string()], &[])).await;
        assert!(pending.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_subscription_ends_when_server_drops_it() -> anyhow::Result<()> {
        let (host, port, state) = spawn_fake_redis().await?;
        let store = RedisStore::connect(&host, port, 0).await?;
        let mut sub = store.subscribe(&["users".to_string()], &[]).await?;
        assert!(timeout(Duration::from_secs(2), sub.recv()).await?.is_some());

        state.kill.send_replace(true);
        assert_eq!(timeout(Duration::from_secs(2), sub.recv()).await?, None);

        // 命令连接不受影响
        store.set("users", b"{}").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_refused() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        drop(listener);
        let res = RedisStore::connect("127.0.0.1", port, 0).await;
        assert!(matches!(res, Err(Error::Connection(_))));
        Ok(())
    }
}
