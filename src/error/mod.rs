use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// 统一请求缺少必填字段，流开始前直接拒绝
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// 注册表中找不到协议，管道构建时拒绝
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// 单个原生事件无法解析，记录日志后跳过
    #[error("Malformed native event: {0}")]
    MalformedNativeEvent(String),

    /// 事件违反协议约束（例如引用了未打开的 block），记录日志后丢弃
    #[error("Protocol invariant violation: {0}")]
    ProtocolInvariantViolation(String),

    #[error("Session already in use: {0}")]
    SessionInUse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 可恢复的错误只影响单个事件，流继续处理
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedNativeEvent(_) | Error::ProtocolInvariantViolation(_)
        )
    }

    /// 用作 metrics 标签的短名称
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::UnsupportedProtocol(_) => "unsupported_protocol",
            Error::MalformedNativeEvent(_) => "malformed_native_event",
            Error::ProtocolInvariantViolation(_) => "protocol_invariant_violation",
            Error::SessionInUse(_) => "session_in_use",
            Error::Config(_) => "config",
            Error::Upstream(_) => "upstream",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
