use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TapsError};
use crate::message::InboundMessage;

/// 消息边界处理器，只用于不保留消息边界的协议栈。
///
/// # 教案式说明
/// - **意图 (Why)**：流式协议栈只交付字节，消息边界由应用约定，核心在发送与接收两端调用本接口；
/// - **契约 (What)**：
///   - `frame` 把一条消息编码为写入协议栈的字节；
///   - `deframe` 从累积缓冲中切出至多一条完整消息，数据不足时返回 `Ok(None)` 且不消费缓冲；
///   - 失败返回 [`TapsError::Framing`]，连接随即以该错误关闭。
pub trait FramingHandler: Send + Sync + 'static {
    fn frame(&self, payload: &Bytes) -> Result<Bytes>;

    fn deframe(&self, buffer: &mut BytesMut) -> Result<Option<InboundMessage>>;
}

const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;
const HEADER_LEN: usize = 4;

/// 4 字节大端长度前缀分帧。
#[derive(Clone, Copy, Debug)]
pub struct LengthPrefixFraming {
    max_frame: usize,
}

impl Default for LengthPrefixFraming {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl LengthPrefixFraming {
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl FramingHandler for LengthPrefixFraming {
    fn frame(&self, payload: &Bytes) -> Result<Bytes> {
        if payload.len() > self.max_frame {
            return Err(TapsError::Framing {
                detail: format!("message of {} bytes exceeds frame limit {}", payload.len(), self.max_frame),
            });
        }
        let length = u32::try_from(payload.len()).map_err(|_| TapsError::Framing {
            detail: "message length does not fit a u32 prefix".into(),
        })?;
        let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
        out.put_u32(length);
        out.extend_from_slice(payload);
        Ok(out.freeze())
    }

    fn deframe(&self, buffer: &mut BytesMut) -> Result<Option<InboundMessage>> {
        if buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if length > self.max_frame {
            return Err(TapsError::Framing {
                detail: format!("peer announced a {length} byte frame, limit is {}", self.max_frame),
            });
        }
        if buffer.len() < HEADER_LEN + length {
            return Ok(None);
        }
        buffer.advance(HEADER_LEN);
        Ok(Some(InboundMessage::complete(buffer.split_to(length).freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let framing = LengthPrefixFraming::default();
        let encoded = framing.frame(&Bytes::from_static(b"hello")).expect("frame");
        let mut buffer = BytesMut::from(&encoded[..6]);
        assert!(framing.deframe(&mut buffer).expect("deframe").is_none());
        assert_eq!(buffer.len(), 6);
        buffer.extend_from_slice(&encoded[6..]);
        let message = framing.deframe(&mut buffer).expect("deframe").expect("complete");
        assert_eq!(message.payload().as_ref(), b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn oversized_announcements_are_rejected() {
        let framing = LengthPrefixFraming::with_max_frame(8);
        let mut buffer = BytesMut::from(&[0u8, 0, 1, 0][..]);
        assert!(matches!(
            framing.deframe(&mut buffer),
            Err(TapsError::Framing { .. })
        ));
    }
}
