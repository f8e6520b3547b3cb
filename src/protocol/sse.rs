//! text/event-stream 编解码
//!
//! 上游的网络分块不保证和 SSE 帧对齐，[`SseParser`] 缓冲未完成的行，
//! 空行结束一帧。

use super::{DecodeFn, NativeEvent};
use crate::error::Result;
use crate::models::Protocol;
use crate::telemetry;
use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::warn;

/// 一个完整的 SSE 帧
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段字节，返回其中已经完整的帧
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.feed_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// 输入结束，把缓冲中最后一个没有空行结尾的帧吐出来
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            let rest = String::from_utf8_lossy(&rest);
            let line = rest.trim_end_matches(['\n', '\r']).to_string();
            if let Some(frame) = self.feed_line(&line) {
                return Some(frame);
            }
        }
        self.take_frame()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.take_frame();
        }
        // 注释行，常用作 keep-alive
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = parse_sse_line(line).unwrap_or((line, ""));
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// 解析 SSE 行 "field: value"
fn parse_sse_line(line: &str) -> Option<(&str, &str)> {
    let pos = line.find(':')?;
    let (field, rest) = line.split_at(pos);
    let value = rest[1..].strip_prefix(' ').unwrap_or(&rest[1..]);
    Some((field.trim(), value))
}

/// 生成 SSE 格式的字符串
pub fn format_sse(event: Option<&str>, data: &str) -> String {
    if let Some(event) = event {
        format!("event: {}\ndata: {}\n\n", event, data)
    } else {
        format!("data: {}\n\n", data)
    }
}

/// 把上游字节流解码成原生事件流
///
/// 无法解析的帧记录日志后跳过；上游传输错误原样透传
pub fn decode_stream<S>(
    input: S,
    protocol: Protocol,
    decode: DecodeFn,
) -> impl Stream<Item = Result<NativeEvent>> + Send + 'static
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    stream! {
        let mut parser = SseParser::new();
        let mut input = Box::pin(input);

        while let Some(chunk) = input.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in parser.push(&bytes) {
                        if let Some(event) = decode_logged(&frame, protocol, decode) {
                            yield Ok(event);
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(frame) = parser.finish() {
            if let Some(event) = decode_logged(&frame, protocol, decode) {
                yield Ok(event);
            }
        }
    }
}

fn decode_logged(frame: &SseFrame, protocol: Protocol, decode: DecodeFn) -> Option<NativeEvent> {
    match decode(frame) {
        Ok(event) => event,
        Err(e) => {
            warn!(%protocol, error = %e, "skipping undecodable SSE frame");
            telemetry::event_dropped(protocol.as_str(), e.kind());
            None
        }
    }
}
