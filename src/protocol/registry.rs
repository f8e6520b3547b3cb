use super::Transform;
use crate::error::{Error, Result};
use crate::models::Protocol;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// 协议 → 转换函数的注册表，启动时填充，之后只读
#[derive(Debug, Clone, Default)]
pub struct Registry {
    transforms: HashMap<Protocol, Transform>,
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    /// 空注册表，用于自定义协议集合
    pub fn empty() -> Self {
        Self::default()
    }

    /// 内置的全部协议
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Transform::openai());
        registry.register(Transform::anthropic());
        registry
    }

    /// 进程级共享的标准注册表
    pub fn global() -> Arc<Registry> {
        GLOBAL.get_or_init(|| Arc::new(Self::standard())).clone()
    }

    pub fn register(&mut self, transform: Transform) {
        debug!(protocol = %transform.protocol, "registering protocol transform");
        self.transforms.insert(transform.protocol, transform);
    }

    pub fn resolve(&self, protocol: Protocol) -> Result<&Transform> {
        self.transforms
            .get(&protocol)
            .ok_or_else(|| Error::UnsupportedProtocol(protocol.to_string()))
    }

    /// 按字符串标识查找，空值或 "unspecified" 使用 `default`
    pub fn resolve_id(&self, id: Option<&str>, default: Protocol) -> Result<&Transform> {
        let protocol = Protocol::resolve(id, default)?;
        self.resolve(protocol)
    }
}
