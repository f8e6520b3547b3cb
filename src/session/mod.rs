//! 每个流式会话的转码状态
//!
//! 同一个 [`SessionState`] 结构同时服务于 normalizer（来源协议侧）和
//! materializer（目标协议侧），两侧各持有一份，见 [`store::SessionSlot`]。

use crate::unified::{FinishReason, UnifiedUsage};
use std::collections::{BTreeMap, HashMap};

pub mod store;

pub use store::{SessionGuard, SessionSlot, SessionStore};

/// 会话阶段，只会前进不会后退
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Streaming,
    Finishing,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// 目标协议侧的内容块
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

impl ContentBlock {
    pub fn kind(&self) -> BlockKind {
        match self {
            ContentBlock::Text => BlockKind::Text,
            ContentBlock::Thinking => BlockKind::Thinking,
            ContentBlock::ToolUse { .. } => BlockKind::ToolUse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBlock {
    pub block: ContentBlock,
    /// thinking block 是否已经收到过签名
    pub signed: bool,
}

/// 来源协议侧记录的 block（block 流的 normalizer 使用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlock {
    pub block: ContentBlock,
    /// 工具块在本消息中的调用序号
    pub tool_ordinal: Option<u32>,
}

impl SourceBlock {
    pub fn kind(&self) -> BlockKind {
        self.block.kind()
    }

    pub fn tool_id(&self) -> Option<&str> {
        match &self.block {
            ContentBlock::ToolUse { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// 终止元数据的 flush 结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalFlush {
    /// 本轮没有可发送的内容
    Nothing,
    /// 发送一个 message_delta，两个字段至少有一个
    Metadata {
        stop_reason: Option<FinishReason>,
        usage: Option<UnifiedUsage>,
    },
}

#[derive(Debug, Clone)]
pub struct SessionState {
    message_id: Option<String>,
    model: Option<String>,
    created: i64,
    phase: Phase,

    next_block_index: u32,
    open_blocks: BTreeMap<u32, OpenBlock>,
    tool_blocks_by_id: HashMap<String, u32>,
    tool_blocks_by_source_index: HashMap<u32, u32>,

    stop_reason_emitted: bool,
    usage_emitted: bool,
    pending_stop_reason: Option<FinishReason>,
    pending_usage: Option<UnifiedUsage>,

    source_blocks: HashMap<u32, SourceBlock>,
    next_tool_ordinal: u32,
    input_tokens: Option<u64>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            message_id: None,
            model: None,
            created: chrono::Utc::now().timestamp(),
            phase: Phase::Init,
            next_block_index: 0,
            open_blocks: BTreeMap::new(),
            tool_blocks_by_id: HashMap::new(),
            tool_blocks_by_source_index: HashMap::new(),
            stop_reason_emitted: false,
            usage_emitted: false,
            pending_stop_reason: None,
            pending_usage: None,
            source_blocks: HashMap::new(),
            next_tool_ordinal: 0,
            input_tokens: None,
        }
    }

    // ================== 消息元数据 ==================

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    /// 锁定消息 id 和模型，只在第一次调用时生效，并进入 Streaming 阶段
    pub fn start_message(&mut self, id: impl Into<String>, model: impl Into<String>) {
        if self.message_id.is_some() {
            return;
        }
        self.message_id = Some(id.into());
        self.model = Some(model.into());
        self.advance(Phase::Streaming);
    }

    pub fn set_created(&mut self, created: i64) {
        self.created = created;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// 推进阶段，返回是否是第一次进入 `phase`
    pub fn advance(&mut self, phase: Phase) -> bool {
        if phase > self.phase {
            self.phase = phase;
            true
        } else {
            false
        }
    }

    // ================== 目标协议 block 账本 ==================

    /// 打开一个新 block，分配下一个索引
    pub fn open_block(&mut self, block: ContentBlock) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        if let ContentBlock::ToolUse { id, .. } = &block {
            self.tool_blocks_by_id.insert(id.clone(), index);
        }
        self.open_blocks.insert(
            index,
            OpenBlock {
                block,
                signed: false,
            },
        );
        index
    }

    /// 关闭 block，索引不会被复用
    pub fn close_block(&mut self, index: u32) -> Option<OpenBlock> {
        self.open_blocks.remove(&index)
    }

    pub fn is_open(&self, index: u32) -> bool {
        self.open_blocks.contains_key(&index)
    }

    pub fn open_block_of_kind(&self, kind: BlockKind) -> Option<u32> {
        self.open_blocks
            .iter()
            .find(|(_, open)| open.block.kind() == kind)
            .map(|(index, _)| *index)
    }

    /// 当前打开的 block 索引，升序
    pub fn open_indices(&self) -> Vec<u32> {
        self.open_blocks.keys().copied().collect()
    }

    pub fn block(&self, index: u32) -> Option<&OpenBlock> {
        self.open_blocks.get(&index)
    }

    pub fn mark_signed(&mut self, index: u32) {
        if let Some(open) = self.open_blocks.get_mut(&index) {
            open.signed = true;
        }
    }

    pub fn next_block_index(&self) -> u32 {
        self.next_block_index
    }

    // ================== 工具调用路由 ==================

    pub fn bind_source_tool_index(&mut self, source_index: u32, block_index: u32) {
        self.tool_blocks_by_source_index
            .insert(source_index, block_index);
    }

    pub fn tool_block_by_id(&self, id: &str) -> Option<u32> {
        self.tool_blocks_by_id
            .get(id)
            .copied()
            .filter(|index| self.is_open(*index))
    }

    pub fn tool_block_by_source_index(&self, source_index: u32) -> Option<u32> {
        self.tool_blocks_by_source_index
            .get(&source_index)
            .copied()
            .filter(|index| self.is_open(*index))
    }

    /// 按 调用 id → 来源序号 → 唯一打开的工具块 的顺序查找目标 block
    pub fn route_tool_fragment(&self, id: Option<&str>, source_index: u32) -> Option<u32> {
        if let Some(index) = id.and_then(|id| self.tool_block_by_id(id)) {
            return Some(index);
        }
        if let Some(index) = self.tool_block_by_source_index(source_index) {
            return Some(index);
        }
        let mut open_tools = self
            .open_blocks
            .iter()
            .filter(|(_, open)| open.block.kind() == BlockKind::ToolUse);
        match (open_tools.next(), open_tools.next()) {
            (Some((index, _)), None) => Some(*index),
            _ => None,
        }
    }

    // ================== 终止元数据 ==================

    pub fn latch_stop_reason(&mut self, reason: FinishReason) {
        if !self.stop_reason_emitted && self.pending_stop_reason.is_none() {
            self.pending_stop_reason = Some(reason);
        }
    }

    pub fn latch_usage(&mut self, usage: UnifiedUsage) {
        if !self.usage_emitted {
            self.pending_usage = Some(usage);
        }
    }

    pub fn stop_reason_emitted(&self) -> bool {
        self.stop_reason_emitted
    }

    /// 两者都已就绪时合并成一次 flush
    ///
    /// 只有一个就绪时继续等待，直到流结束时由 [`SessionState::flush_remaining`] 单独发出
    pub fn flush_terminal(&mut self) -> TerminalFlush {
        if self.stop_reason_emitted || self.usage_emitted {
            return self.flush_remaining();
        }
        if self.pending_stop_reason.is_some() && self.pending_usage.is_some() {
            return self.flush_remaining();
        }
        TerminalFlush::Nothing
    }

    /// 发出所有尚未发出的终止元数据，每项最多一次
    pub fn flush_remaining(&mut self) -> TerminalFlush {
        let stop_reason = if self.stop_reason_emitted {
            None
        } else {
            self.pending_stop_reason.take()
        };
        let usage = if self.usage_emitted {
            None
        } else {
            self.pending_usage.take()
        };
        if stop_reason.is_some() {
            self.stop_reason_emitted = true;
        }
        if usage.is_some() {
            self.usage_emitted = true;
        }
        if stop_reason.is_none() && usage.is_none() {
            TerminalFlush::Nothing
        } else {
            TerminalFlush::Metadata { stop_reason, usage }
        }
    }

    pub fn terminal_complete(&self) -> bool {
        self.stop_reason_emitted && self.usage_emitted
    }

    // ================== 来源协议 block 记录 ==================

    /// 记录来源侧打开的 block，工具块分配下一个调用序号
    pub fn record_source_block(&mut self, index: u32, block: ContentBlock) -> SourceBlock {
        let tool_ordinal = (block.kind() == BlockKind::ToolUse).then(|| {
            let ordinal = self.next_tool_ordinal;
            self.next_tool_ordinal += 1;
            ordinal
        });
        let block = SourceBlock { block, tool_ordinal };
        self.source_blocks.insert(index, block.clone());
        block
    }

    pub fn source_block(&self, index: u32) -> Option<&SourceBlock> {
        self.source_blocks.get(&index)
    }

    pub fn retire_source_block(&mut self, index: u32) -> Option<SourceBlock> {
        self.source_blocks.remove(&index)
    }

    pub fn record_input_tokens(&mut self, tokens: u64) {
        self.input_tokens = Some(tokens);
    }

    pub fn input_tokens(&self) -> Option<u64> {
        self.input_tokens
    }
}
