//! 适配器后台任务表

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// 按键管理的后台任务（轮询任务、共享定时器、重连任务）。
#[derive(Default)]
pub(crate) struct TaskSet {
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskSet {
    /// 启动任务；同键旧任务被中止。
    pub(crate) fn spawn<F>(&self, key: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if let Some(previous) = self.handles().insert(key.into(), handle) {
            previous.abort();
        }
    }

    /// 仅在同键任务不存在或已结束时启动。
    pub(crate) fn spawn_if_idle<F>(&self, key: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles();
        if handles.get(key).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        handles.insert(key.to_string(), tokio::spawn(task));
        true
    }

    /// 中止并等待指定任务结束。
    pub(crate) async fn stop(&self, key: &str) -> bool {
        let handle = self.handles().remove(key);
        match handle {
            Some(handle) => {
                handle.abort();
                let _ = handle.await;
                true
            }
            None => false,
        }
    }

    /// 中止全部任务，返回前确认每个任务都已结束。
    pub(crate) async fn stop_all(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
