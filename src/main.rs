// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warp::Filter;

use rmap::{Collection, CollectionOptions, Connection, EventKind, MonitorSink, config, monitor::Metrics};

#[derive(Parser, Debug)]
#[command(name = "rmap", version, about = "Replicated key-value map over a shared store")]
struct Cli {
    /// 配置文件路径，不存在时自动生成默认配置
    #[arg(short, long, default_value = "rmap.json")]
    config: PathBuf,

    /// 覆盖配置中的 store_url
    #[arg(long)]
    url: Option<String>,

    /// 集合名称
    collection: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 读取本地副本中的一个 key
    Get { key: String },
    /// 写入 key，value 按 JSON 解析，解析失败则当作字符串
    Set {
        key: String,
        value: String,
        /// 过期时间（秒）
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// 删除 key
    Del { key: String },
    /// 清空集合
    Clear,
    /// 打印所有条目
    Dump,
    /// 持续打印副本变更，直到 Ctrl-C
    Watch,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// 在 metrics_port 上暴露 /metrics（Prometheus 文本）
fn spawn_metrics_server(metrics: Arc<Metrics>, port: u16) {
    let route = warp::path("metrics").and(warp::get()).map(move || metrics.to_prometheus());
    info!(port, "metrics endpoint listening");
    tokio::spawn(warp::serve(route).run(([0, 0, 0, 0], port)));
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut cfg = config::load(&cli.config)
        .with_context(|| format!("failed to load config {:?}", cli.config))?;
    if let Some(url) = cli.url {
        cfg.store_url = url;
    }

    let conn = Connection::connect(&cfg).await.context("failed to connect to store")?;

    let sink: MonitorSink = Arc::new(|kind, msg, name| {
        if kind == EventKind::Error {
            eprintln!("[{}] {}: {}", name, kind, msg);
        }
    });
    let options = CollectionOptions::default().with_monitor(sink);
    let collection = Collection::open(&conn, &cli.collection, options).await?;

    match cli.command {
        Command::Get { key } => match collection.get(&key) {
            Some(v) => println!("{}", v),
            None => println!("(nil)"),
        },
        Command::Set { key, value, ttl } => {
            collection.set_value(&key, parse_value(&value), ttl).await?;
            println!("OK");
        }
        Command::Del { key } => {
            collection.delete(&key).await?;
            println!("OK");
        }
        Command::Clear => {
            collection.clear().await?;
            println!("OK");
        }
        Command::Dump => {
            for (k, v) in collection.entries() {
                println!("{} {}", k, v);
            }
        }
        Command::Watch => {
            if cfg.metrics_enabled {
                spawn_metrics_server(conn.metrics().clone(), cfg.metrics_port);
            }
            let mut events = collection.watch();
            println!("watching '{}' ({} entries), Ctrl-C to stop", collection.name(), collection.len());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    ev = events.recv() => match ev {
                        Ok(ev) => println!("{:?}", ev),
                        Err(RecvError::Lagged(n)) => warn!(skipped = n, "watcher lagged"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }
    }

    collection.close();
    conn.disconnect().await?;
    Ok(())
}
