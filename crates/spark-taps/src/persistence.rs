//! 上下文状态持久化。
//!
//! 只保存可重建的配置类状态：引擎配置、传输/安全默认参数与默认发送参数。
//! 协议栈注册表、解析器与处理器都是运行期对象，恢复时沿用当前上下文已有的实例。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::EstablishmentConfig;
use crate::error::{Result, TapsError};
use crate::message::SendParameters;
use crate::parameters::ParameterSnapshot;

/// 上下文的可持久化快照。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    pub config: EstablishmentConfig,
    pub transport_defaults: ParameterSnapshot,
    pub security_defaults: ParameterSnapshot,
    #[serde(default)]
    pub send_defaults: SendParameters,
}

/// 快照编解码器。
///
/// # 教案式说明
/// - **意图 (Why)**：存储格式属于部署决策（JSON、二进制、加密存储），核心只依赖这一对函数；
/// - **契约 (What)**：`restore(save(state)) == state`；格式错误返回 [`TapsError::Persistence`]。
pub trait Persistence: Send + Sync + 'static {
    fn save(&self, state: &ContextState) -> Result<Vec<u8>>;

    fn restore(&self, blob: &[u8]) -> Result<ContextState>;
}

/// 以 `serde_json` 编码的默认实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonPersistence {
    pretty: bool,
}

impl JsonPersistence {
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl Persistence for JsonPersistence {
    fn save(&self, state: &ContextState) -> Result<Vec<u8>> {
        let encoded = if self.pretty {
            serde_json::to_vec_pretty(state)
        } else {
            serde_json::to_vec(state)
        };
        encoded.map_err(|err| persistence_error("encode", err))
    }

    fn restore(&self, blob: &[u8]) -> Result<ContextState> {
        serde_json::from_slice(blob).map_err(|err| persistence_error("decode", err))
    }
}

pub(crate) fn write_file(path: &Path, blob: &[u8]) -> Result<()> {
    std::fs::write(path, blob).map_err(|err| persistence_error(&format!("write {}", path.display()), err))
}

pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| persistence_error(&format!("read {}", path.display()), err))
}

fn persistence_error(action: &str, err: impl std::fmt::Display) -> TapsError {
    TapsError::Persistence {
        detail: format!("{action}: {err}"),
    }
}
