//! 并发派发器：有界并发地运行研究单元并按派发顺序收集结果
//!
//! Semaphore 限制同时存活的单元数；许可按派发顺序在 spawn 之前获取，多出的主题排队等待空位。
//! join_all 作为汇合屏障，输出顺序与请求顺序一致。单元 panic 时产出降级结果，不影响兄弟单元。

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::core::state::ResearchUnitOutput;

/// 一次派发的结果：outputs 与请求一一对应，peak_active 为观测到的最大并发数
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub outputs: Vec<ResearchUnitOutput>,
    pub peak_active: usize,
}

/// 活跃计数守卫：单元结束（含 panic 展开）时归还计数
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(active.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 并发派发器
pub struct ConcurrencyDispatcher {
    limit: usize,
}

impl ConcurrencyDispatcher {
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1) }
    }

    /// 派发全部主题；run_unit(index, topic) 产出单元结果。返回时所有单元均已结束
    pub async fn dispatch<F, Fut>(&self, topics: Vec<String>, run_unit: F) -> DispatchReport
    where
        F: Fn(usize, String) -> Fut,
        Fut: Future<Output = ResearchUnitOutput> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(topics.len());

        for (index, topic) in topics.iter().enumerate() {
            // 按派发顺序排队：拿到许可后才 spawn
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(index, error = %e, "Dispatcher semaphore closed");
                    handles.push(None);
                    continue;
                }
            };
            let unit = run_unit(index, topic.clone());
            let active = active.clone();
            let peak = peak.clone();
            let span = tracing::info_span!("research_unit", index, topic = %topic);
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    let _guard = ActiveGuard::enter(&active, &peak);
                    tracing::debug!("Research unit started");
                    unit.await
                }
                .instrument(span),
            );
            handles.push(Some(handle));
        }

        let joined = join_all(handles.into_iter().map(|h| async move {
            match h {
                Some(handle) => Some(handle.await),
                None => None,
            }
        }))
        .await;

        let outputs = topics
            .into_iter()
            .zip(joined)
            .enumerate()
            .map(|(index, (topic, result))| match result {
                Some(Ok(output)) => output,
                Some(Err(e)) => {
                    tracing::error!(index, %topic, error = %e, "Research unit failed");
                    ResearchUnitOutput::failed(topic, format!("Research unit failed: {e}"))
                }
                None => ResearchUnitOutput::failed(topic, "Research unit was never started"),
            })
            .collect();

        DispatchReport {
            outputs,
            peak_active: peak.load(Ordering::SeqCst),
        }
    }
}
