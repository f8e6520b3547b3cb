use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 流式转码支持的线协议
///
/// 封闭集合：新增协议 = 新增一个变体 + 在注册表里登记一组转换函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// OpenAI 协议格式（chat/completions，增量 delta 流）
    OpenAI,
    /// Anthropic 协议格式（Messages API，block 流）
    Anthropic,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenAI => "openai",
            Protocol::Anthropic => "anthropic",
        }
    }

    /// 解析协议标识，空值或 "unspecified" 回落到 `default`
    ///
    /// 其余未知标识一律失败，不做静默降级
    pub fn resolve(id: Option<&str>, default: Protocol) -> Result<Protocol> {
        match id.map(str::trim) {
            None | Some("") => Ok(default),
            Some(id) if id.eq_ignore_ascii_case("unspecified") => Ok(default),
            Some(id) => id.parse(),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai-compatible" | "chat_completions" => Ok(Protocol::OpenAI),
            "anthropic" | "messages" => Ok(Protocol::Anthropic),
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_identifiers() {
        assert_eq!("OpenAI".parse::<Protocol>().unwrap(), Protocol::OpenAI);
        assert_eq!("anthropic".parse::<Protocol>().unwrap(), Protocol::Anthropic);
        assert_eq!("messages".parse::<Protocol>().unwrap(), Protocol::Anthropic);
    }

    #[test]
    fn unknown_identifier_fails_closed() {
        let err = "gemini".parse::<Protocol>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(ref p) if p == "gemini"));
    }

    #[test]
    fn unspecified_uses_default() {
        assert_eq!(
            Protocol::resolve(None, Protocol::OpenAI).unwrap(),
            Protocol::OpenAI
        );
        assert_eq!(
            Protocol::resolve(Some("unspecified"), Protocol::Anthropic).unwrap(),
            Protocol::Anthropic
        );
        assert!(Protocol::resolve(Some("cohere"), Protocol::OpenAI).is_err());
    }
}
