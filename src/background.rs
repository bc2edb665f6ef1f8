//! 过期上传会话清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::SESSION_SWEEP_INTERVAL_SECS;
use crate::orchestrator::UploadOrchestrator;

/// 启动后台任务（过期会话清扫）。
pub fn spawn_background_tasks(orchestrator: Arc<UploadOrchestrator>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let evicted = orchestrator.evict_stale_sessions().await;
            if evicted > 0 {
                debug!(evicted, "stale session sweep");
            }
        }
    });
}
