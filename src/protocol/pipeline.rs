//! 流式转码入口
//!
//! `native(A) → normalize(A) → 统一 chunk → materialize(B) → native(B)`
//!
//! 每个会话一条有序管道。会话状态在管道构建时创建，随输出流析构删除，
//! 所以正常结束、上游出错和下游提前 drop 都会释放状态。出错时目标协议
//! 发出自己的 error 事件，不伪造正常的结束元数据。

use super::registry::Registry;
use super::{sse, NativeEvent, Transform};
use crate::config::TranscoderConfig;
use crate::error::Result;
use crate::models::Protocol;
use crate::session::{SessionSlot, SessionStore};
use crate::telemetry;
use crate::unified::UnifiedStreamChunk;
use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub type NativeEventStream = Pin<Box<dyn Stream<Item = Result<NativeEvent>> + Send>>;
pub type UnifiedChunkStream = Pin<Box<dyn Stream<Item = Result<UnifiedStreamChunk>> + Send>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub struct Transcoder {
    registry: Arc<Registry>,
    store: SessionStore,
    config: TranscoderConfig,
}

impl Transcoder {
    pub fn new(config: TranscoderConfig) -> Self {
        Self {
            registry: Registry::global(),
            store: SessionStore::new(),
            config,
        }
    }

    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    /// 解析协议标识，缺省时使用配置的默认协议
    pub fn resolve_protocol(&self, id: Option<&str>) -> Result<Protocol> {
        Ok(self.registry.resolve_id(id, self.config.default_protocol)?.protocol)
    }

    /// 把来源协议的原生事件流转码成目标协议的原生事件流
    ///
    /// 协议不支持或会话 id 已被占用时直接返回错误，不产生任何输出
    pub fn transcode<S>(
        &self,
        source: Protocol,
        destination: Protocol,
        session_id: &str,
        input: S,
    ) -> Result<NativeEventStream>
    where
        S: Stream<Item = Result<NativeEvent>> + Send + 'static,
    {
        let src = *self.registry.resolve(source)?;
        let dst = *self.registry.resolve(destination)?;
        let guard = self.store.open(session_id)?;
        let config = self.config.clone();

        info!(
            session_id,
            source = %source,
            destination = %destination,
            "starting stream transcoding"
        );

        Ok(Box::pin(stream! {
            let mut input = Box::pin(input);

            while let Some(item) = input.next().await {
                let outcome = item.and_then(|event| {
                    guard
                        .with(|slot| step(&src, &dst, &config, &event, slot))
                        .unwrap_or_else(|| Ok(Vec::new()))
                });
                match outcome {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                        if guard.with(|slot| slot.egress.is_finished()).unwrap_or(true) {
                            debug!(session_id = guard.session_id(), "destination stream finished");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(session_id = guard.session_id(), error = %e, "stream failed, aborting destination");
                        let events = guard
                            .with(|slot| (dst.abort)(&mut slot.egress, &config, &e))
                            .unwrap_or_default();
                        for event in events {
                            yield Ok(event);
                        }
                        yield Err(e);
                        return;
                    }
                }
            }

            let events = guard
                .with(|slot| (dst.finish)(&mut slot.egress, &config))
                .unwrap_or_default();
            for event in events {
                yield Ok(event);
            }
            debug!(session_id = guard.session_id(), "stream transcoding completed");
        }))
    }

    /// 只做归一化，输出统一 chunk 流
    pub fn normalize<S>(&self, source: Protocol, session_id: &str, input: S) -> Result<UnifiedChunkStream>
    where
        S: Stream<Item = Result<NativeEvent>> + Send + 'static,
    {
        let src = *self.registry.resolve(source)?;
        let guard = self.store.open(session_id)?;

        Ok(Box::pin(stream! {
            let mut input = Box::pin(input);

            while let Some(item) = input.next().await {
                let chunk = item.and_then(|event| {
                    guard
                        .with(|slot| normalize_logged(&src, &event, slot))
                        .unwrap_or(Ok(None))
                });
                match chunk {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }))
    }

    /// 字节级入口：上游 SSE 字节 → 下游 SSE 字节
    pub fn transcode_sse<S>(
        &self,
        source: Protocol,
        destination: Protocol,
        session_id: &str,
        input: S,
    ) -> Result<ByteStream>
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        let src = *self.registry.resolve(source)?;
        let events = sse::decode_stream(input, source, src.decode);
        let native = self.transcode(source, destination, session_id, events)?;
        Ok(Box::pin(native.map(|item| item.and_then(|event| event.to_sse()))))
    }
}

/// 可恢复的错误只丢弃当前事件，其余错误中止整条流
fn normalize_logged(
    src: &Transform,
    event: &NativeEvent,
    slot: &mut SessionSlot,
) -> Result<Option<UnifiedStreamChunk>> {
    match (src.normalize)(event, &mut slot.ingress) {
        Ok(chunk) => Ok(chunk),
        Err(e) if e.is_recoverable() => {
            warn!(
                protocol = %src.protocol,
                event = event.event_name(),
                error = %e,
                "dropping native event"
            );
            telemetry::event_dropped(src.protocol.as_str(), e.kind());
            Ok(None)
        }
        Err(e) => {
            error!(
                protocol = %src.protocol,
                event = event.event_name(),
                error = %e,
                "normalization failed"
            );
            Err(e)
        }
    }
}

fn step(
    src: &Transform,
    dst: &Transform,
    config: &TranscoderConfig,
    event: &NativeEvent,
    slot: &mut SessionSlot,
) -> Result<Vec<NativeEvent>> {
    Ok(match normalize_logged(src, event, slot)? {
        Some(chunk) => (dst.materialize)(&chunk, &mut slot.egress, config),
        None => Vec::new(),
    })
}
