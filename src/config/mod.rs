use crate::error::Result;
use crate::models::Protocol;
use serde::{Deserialize, Serialize};

/// 转码器的主配置结构
/// 包含转码行为和日志两部分
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// 转码相关配置
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 转码配置
/// 控制 materializer 需要补出的合成事件
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscoderConfig {
    /// 协议标识缺省（或为 "unspecified"）时使用的协议
    #[serde(default = "default_protocol")]
    pub default_protocol: Protocol,
    /// thinking block 关闭前若没有收到真实签名，是否补一个合成的 signature_delta
    #[serde(default = "default_true")]
    pub synthesize_thinking_signature: bool,
    /// message_start 之后是否紧跟一个 ping 事件
    #[serde(default)]
    pub ping_after_message_start: bool,
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 默认日志级别，RUST_LOG 环境变量优先
    #[serde(default = "default_level")]
    pub level: String,
    /// 是否输出 JSON 格式日志
    #[serde(default)]
    pub json: bool,
}

fn default_protocol() -> Protocol {
    Protocol::OpenAI
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            default_protocol: default_protocol(),
            synthesize_thinking_signature: true,
            ping_after_message_start: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

impl Default for Config {
    /// 默认配置
    /// - 未指定协议时按 OpenAI 兼容处理
    /// - 合成 thinking 签名，不发 ping
    /// - info 级别文本日志
    fn default() -> Self {
        Self {
            transcoder: TranscoderConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// 从配置文件加载配置
    ///
    /// 1. 首先从指定文件加载配置（YAML、TOML、JSON 均可）
    /// 2. 然后从环境变量覆盖配置（前缀为TRANSCODER，分隔符为__）
    ///    例如：TRANSCODER__LOGGING__LEVEL=debug 会覆盖 logging.level
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TRANSCODER").separator("__"))
            .build()
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::error::Error::Config(e.to_string()))
    }
}
