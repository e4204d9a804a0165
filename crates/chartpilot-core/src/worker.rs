//! 周期性后台任务

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;

/// 周期执行器：每次执行后等待 `interval`，出错时等待 `backoff`
#[derive(Debug, Clone)]
pub struct PeriodicWorker {
    name: String,
    interval: Duration,
    backoff: Duration,
    shutdown: CancellationToken,
}

impl PeriodicWorker {
    pub fn new(name: impl Into<String>, interval: Duration, backoff: Duration, shutdown: CancellationToken) -> Self {
        Self {
            name: name.into(),
            interval,
            backoff,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 运行直到收到取消信号，返回执行的轮次
    ///
    /// 取消信号在等待期间立即生效；正在执行的一轮不会被中断。
    pub async fn run<F, Fut>(&self, mut tick: F) -> u64
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        info!("Worker {} started (interval {:?})", self.name, self.interval);
        let mut rounds = 0u64;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // 已开始的一轮总是执行完毕，取消只在轮次之间生效
            let wait = match tick().await {
                Ok(()) => self.interval,
                Err(e) => {
                    error!("Worker {} tick failed, backing off {:?}: {}", self.name, self.backoff, e);
                    self.backoff
                }
            };
            rounds += 1;
            debug!("Worker {} completed round {}", self.name, rounds);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Worker {} stopped after {} rounds", self.name, rounds);
        rounds
    }
}
