use super::SessionState;
use crate::error::{Error, Result};
use crate::telemetry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// 一个会话的两份状态
///
/// `ingress` 给来源协议的 normalizer，`egress` 给目标协议的 materializer
#[derive(Debug, Default)]
pub struct SessionSlot {
    pub ingress: SessionState,
    pub egress: SessionState,
}

/// 会话状态存储
///
/// 使用DashMap实现线程安全的并发存储。
/// 所有权规则：一个会话 id 同一时间只属于一个管道，
/// 条目随 [`SessionGuard`] 析构删除，不依赖后台清理。
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    /// Key: 调用方给出的会话 id
    storage: Arc<DashMap<String, SessionSlot>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建会话条目并返回守卫
    ///
    /// 同一 id 已有活跃会话时返回 [`Error::SessionInUse`]
    pub fn open(&self, session_id: &str) -> Result<SessionGuard> {
        match self.storage.entry(session_id.to_string()) {
            Entry::Occupied(_) => return Err(Error::SessionInUse(session_id.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(SessionSlot::default());
            }
        }

        telemetry::session_opened();
        debug!(session_id, "session opened");

        Ok(SessionGuard {
            session_id: session_id.to_string(),
            store: self.clone(),
        })
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.storage.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    fn remove(&self, session_id: &str) {
        if self.storage.remove(session_id).is_some() {
            telemetry::session_closed();
            debug!(session_id, "session closed");
        }
    }
}

/// 会话守卫，析构时删除会话条目
///
/// 正常结束、上游出错、下游取消（stream 被 drop）三条路径都会走到析构
pub struct SessionGuard {
    session_id: String,
    store: SessionStore,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 持有分片写锁执行 `f`，锁只覆盖一次同步转换
    pub fn with<R>(&self, f: impl FnOnce(&mut SessionSlot) -> R) -> Option<R> {
        let mut slot = self.store.storage.get_mut(&self.session_id)?;
        Some(f(&mut slot))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.store.remove(&self.session_id);
    }
}
