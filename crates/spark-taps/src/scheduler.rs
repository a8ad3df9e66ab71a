//! # scheduler 模块说明
//!
//! ## 角色定位（Why）
//! - 每条连接一个逻辑发送队列：按 niceness 升序出队，`ordered` 消息之间严格保持提交顺序，
//!   寿命到期未出队的消息被移除，前驱未离开队列的消息被挂起；
//! - 队列本身是纯同步数据结构，由连接的调度任务在 `parking_lot::Mutex` 下单写者操作，
//!   异步部分（写入协议栈、定时器）留在 `connection` 模块。
//!
//! ## 数据结构（How）
//! - 消息引用是竞技场句柄：`next_ref` 之前签发过、且已不在表中的引用即“已离开队列”；
//! - 槽位三态：`Reserved`（预留未提交）、`Queued`（等待出队）、`InFlight`（已交给协议栈）；
//! - 提交时对前驱关系做可达性扫描，成环即拒绝。

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use crate::error::{Result, TapsError};
use crate::message::{MessageRef, OutboundMessage};

#[derive(Debug)]
struct Queued {
    seq: u64,
    message: OutboundMessage,
    deadline: Option<Instant>,
}

#[derive(Debug)]
enum Slot {
    Reserved,
    Queued(Queued),
    InFlight(u64),
}

/// 单连接发送队列。
#[derive(Debug, Default)]
pub(crate) struct MessageQueue {
    next_ref: u64,
    next_seq: u64,
    slots: HashMap<MessageRef, Slot>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(&mut self) -> MessageRef {
        let reference = MessageRef::new(self.next_ref);
        self.next_ref += 1;
        reference
    }

    /// 预留一个引用，供之后的消息把它列为前驱，或以它为身份提交。
    pub fn reserve(&mut self) -> MessageRef {
        let reference = self.issue();
        self.slots.insert(reference, Slot::Reserved);
        reference
    }

    /// 引用由本队列签发且已经离开队列（发送、过期或失败）。
    pub fn has_left(&self, reference: MessageRef) -> bool {
        reference.get() < self.next_ref && !self.slots.contains_key(&reference)
    }

    /// 提交一条消息。
    ///
    /// # 契约 (What)
    /// - `reserved` 为 `Some` 时必须是尚未提交的预留引用，否则 `InvalidAntecedent`；
    /// - 前驱必须由本队列签发，否则 `InvalidAntecedent`；
    /// - 前驱链可达自身时返回 `AntecedentCycle`，队列保持不变。
    pub fn submit(
        &mut self,
        reserved: Option<MessageRef>,
        message: OutboundMessage,
        now: Instant,
    ) -> Result<MessageRef> {
        if let Some(reference) = reserved
            && !matches!(self.slots.get(&reference), Some(Slot::Reserved))
        {
            return Err(TapsError::InvalidAntecedent {
                reference,
                detail: "not an outstanding reservation of this connection".into(),
            });
        }
        for antecedent in message.antecedents() {
            if antecedent.get() >= self.next_ref {
                return Err(TapsError::InvalidAntecedent {
                    reference: *antecedent,
                    detail: "not issued by this connection".into(),
                });
            }
        }

        let reference = match reserved {
            Some(reference) => {
                if self.reaches(message.antecedents(), reference) {
                    return Err(TapsError::AntecedentCycle { message: reference });
                }
                reference
            }
            None => self.issue(),
        };

        let deadline = message
            .parameters()
            .lifetime
            .map(|lifetime| now + lifetime);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(
            reference,
            Slot::Queued(Queued {
                seq,
                message,
                deadline,
            }),
        );
        Ok(reference)
    }

    /// 从 `start` 出发沿排队消息的前驱边能否到达 `target`。
    fn reaches(&self, start: &[MessageRef], target: MessageRef) -> bool {
        let mut stack: Vec<MessageRef> = start.to_vec();
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(Slot::Queued(queued)) = self.slots.get(&current) {
                stack.extend_from_slice(queued.message.antecedents());
            }
        }
        false
    }

    fn eligible(&self, queued: &Queued) -> bool {
        if !queued
            .message
            .antecedents()
            .iter()
            .all(|antecedent| self.has_left(*antecedent))
        {
            return false;
        }
        if queued.message.parameters().ordered {
            let blocked_by_earlier = self.slots.values().any(|slot| match slot {
                Slot::Queued(other) => other.message.parameters().ordered && other.seq < queued.seq,
                _ => false,
            });
            if blocked_by_earlier {
                return false;
            }
        }
        true
    }

    /// 取出下一条可发送的消息并标记为在途：可发送集合中 `(niceness, seq)` 最小者。
    pub fn next_ready(&mut self) -> Option<(MessageRef, OutboundMessage)> {
        let chosen = self
            .slots
            .iter()
            .filter_map(|(reference, slot)| match slot {
                Slot::Queued(queued) if self.eligible(queued) => Some((
                    (queued.message.parameters().niceness, queued.seq),
                    *reference,
                )),
                _ => None,
            })
            .min()
            .map(|(_, reference)| reference)?;

        match self.slots.remove(&chosen) {
            Some(Slot::Queued(queued)) => {
                self.slots.insert(chosen, Slot::InFlight(queued.seq));
                Some((chosen, queued.message))
            }
            _ => None,
        }
    }

    /// 在途消息完成（成功或失败），从表中移除。
    ///
    /// 返回 `false` 表示该消息已被 [`drain_all`](Self::drain_all) 带走，调用方不得再为它投递事件。
    pub fn complete(&mut self, reference: MessageRef) -> bool {
        if matches!(self.slots.get(&reference), Some(Slot::InFlight(_))) {
            self.slots.remove(&reference);
            return true;
        }
        false
    }

    /// 0-RTT 数据已随握手发出：直接移除仍在排队的消息。
    pub fn take_queued(&mut self, reference: MessageRef) -> bool {
        if matches!(self.slots.get(&reference), Some(Slot::Queued(_))) {
            self.slots.remove(&reference);
            return true;
        }
        false
    }

    /// 移除寿命已到且仍在排队的消息，按提交顺序返回。
    pub fn expire_due(&mut self, now: Instant) -> Vec<MessageRef> {
        let mut due: Vec<(u64, MessageRef)> = self
            .slots
            .iter()
            .filter_map(|(reference, slot)| match slot {
                Slot::Queued(Queued {
                    seq,
                    deadline: Some(deadline),
                    ..
                }) if *deadline <= now => Some((*seq, *reference)),
                _ => None,
            })
            .collect();
        due.sort_unstable();
        for (_, reference) in &due {
            self.slots.remove(reference);
        }
        due.into_iter().map(|(_, reference)| reference).collect()
    }

    /// 最早的排队消息截止时刻。
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Queued(queued) => queued.deadline,
                _ => None,
            })
            .min()
    }

    /// 清空队列（排队、在途与预留），按提交顺序返回排队与在途消息的引用。
    pub fn drain_all(&mut self) -> Vec<MessageRef> {
        let mut pending: Vec<(u64, MessageRef)> = self
            .slots
            .iter()
            .filter_map(|(reference, slot)| match slot {
                Slot::Queued(queued) => Some((queued.seq, *reference)),
                Slot::InFlight(seq) => Some((*seq, *reference)),
                Slot::Reserved => None,
            })
            .collect();
        pending.sort_unstable();
        self.slots.clear();
        pending.into_iter().map(|(_, reference)| reference).collect()
    }

    #[cfg(test)]
    pub fn has_in_flight(&self) -> bool {
        self.slots
            .values()
            .any(|slot| matches!(slot, Slot::InFlight(_)))
    }

    #[cfg(test)]
    pub fn queued_len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Queued(_)))
            .count()
    }
}
