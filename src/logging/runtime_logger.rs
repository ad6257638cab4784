// src/logging/runtime_logger.rs

use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task;
use tokio::time::{self, Duration};
use tracing_appender::rolling;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::MakeWriter;

use crate::logging::audit_log::AuctionAuditLog;

/// 审计日志写入器
///
/// 审计条目走 mpsc 通道进后台任务，攒批落盘（按小时滚动的 json 文件），
/// 定时刷新兜底；另有一个后台任务按保留时长清理旧文件。
pub struct RuntimeLogger {
    sender: Sender<AuctionAuditLog>,
}

impl RuntimeLogger {
    /// - `log_dir`: 日志目录
    /// - `buffer_size`: 通道缓冲条数
    /// - `batch_size`: 攒多少条写一次盘
    /// - `flush_interval_ms`: 定时刷新间隔（毫秒）
    pub fn new(
        log_dir: &str,
        buffer_size: usize,
        batch_size: usize,
        flush_interval_ms: u64,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let appender = Arc::new(rolling::hourly(log_dir, "auction_audit.json"));

        let logger = Arc::new(Self { sender });
        tokio::spawn(Self::background_log_writer(
            appender,
            receiver,
            batch_size,
            flush_interval_ms,
        ));
        {
            let log_dir = log_dir.to_string();
            tokio::spawn(async move {
                let retention_hours = 72;
                let cleanup_interval = Duration::from_secs(3600);
                loop {
                    Self::cleanup_old_logs(&log_dir, retention_hours).await;
                    tokio::time::sleep(cleanup_interval).await;
                }
            });
        }
        logger
    }

    /// 记一条审计日志（非阻塞，通道满了就丢并打印到 stderr）
    pub async fn log(&self, entry: AuctionAuditLog) {
        if let Err(e) = self.sender.send(entry).await {
            eprintln!("Failed to send audit log entry: {}", e);
        }
    }

    async fn background_log_writer(
        appender: Arc<RollingFileAppender>,
        mut receiver: Receiver<AuctionAuditLog>,
        batch_size: usize,
        flush_interval_ms: u64,
    ) {
        let mut buffer: Vec<String> = Vec::new();
        let mut interval = time::interval(Duration::from_millis(flush_interval_ms));
        loop {
            tokio::select! {
                Some(entry) = receiver.recv() => {
                    match serde_json::to_string(&entry) {
                        Ok(line) => buffer.push(line),
                        Err(e) => eprintln!("Failed to serialize audit log entry: {}", e),
                    }
                    if buffer.len() >= batch_size {
                        Self::write_logs_to_disk(appender.clone(), &mut buffer).await;
                    }
                },
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        Self::write_logs_to_disk(appender.clone(), &mut buffer).await;
                    }
                }
            }
        }
    }

    async fn write_logs_to_disk(appender: Arc<RollingFileAppender>, buffer: &mut Vec<String>) {
        let content = buffer.join("\n") + "\n";
        buffer.clear();
        let appender = Arc::clone(&appender);
        let result = task::spawn_blocking(move || {
            let mut writer = appender.make_writer();
            writer.write_all(content.as_bytes())
        })
        .await;
        match result {
            Ok(Err(e)) => eprintln!("Failed to write audit logs: {}", e),
            Err(e) => eprintln!("Audit log writer task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    async fn cleanup_old_logs(log_dir: &str, retention_hours: u64) {
        use std::time::{Duration as StdDuration, SystemTime};
        let retention = StdDuration::from_secs(retention_hours * 3600);
        let now = SystemTime::now();
        match tokio::fs::read_dir(log_dir).await {
            Ok(mut dir) => {
                while let Ok(Some(entry)) = dir.next_entry().await {
                    let path = entry.path();
                    if let Ok(metadata) = entry.metadata().await {
                        if let Ok(modified) = metadata.modified() {
                            if now.duration_since(modified).unwrap_or_default() > retention {
                                if let Err(e) = tokio::fs::remove_file(&path).await {
                                    eprintln!("Failed to delete old log file {:?}: {}", path, e);
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                eprintln!("Failed to read log directory {}: {}", log_dir, e);
            }
        }
    }
}
