//! 引擎配置。
//!
//! 时长字段在外部表示中统一使用毫秒整数，便于在 TOML 中手写。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TapsError};

const DEFAULT_STAGGER: Duration = Duration::from_millis(250);
const DEFAULT_ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_CONCURRENT_ATTEMPTS: usize = 4;
const DEFAULT_RECEIVE_BUFFER: usize = 64;

/// 建连与收发的运行参数。
///
/// # 教案式说明
/// - **意图 (Why)**：错峰延迟、总超时与并发上限决定竞速的时序行为，需要可配置且可持久化；
/// - **契约 (What)**：
///   - `stagger_delay`：相邻两次尝试的最小启动间隔，默认 250ms（RFC 8305 建议值）；
///   - `establishment_timeout`：整次建连的上限，必须大于零；
///   - `max_concurrent_attempts`：同时在途的尝试数上限，必须大于零；
///   - `receive_buffer`：入站消息队列深度，必须大于零；
/// - **执行 (How)**：`validate` 在上下文构建与恢复时同步调用，违例返回 `InvalidConfiguration`。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstablishmentConfig {
    #[serde(rename = "stagger_delay_ms", with = "millis")]
    pub stagger_delay: Duration,
    #[serde(rename = "establishment_timeout_ms", with = "millis")]
    pub establishment_timeout: Duration,
    pub max_concurrent_attempts: usize,
    pub receive_buffer: usize,
}

impl Default for EstablishmentConfig {
    fn default() -> Self {
        Self {
            stagger_delay: DEFAULT_STAGGER,
            establishment_timeout: DEFAULT_ESTABLISHMENT_TIMEOUT,
            max_concurrent_attempts: DEFAULT_MAX_CONCURRENT_ATTEMPTS,
            receive_buffer: DEFAULT_RECEIVE_BUFFER,
        }
    }
}

impl EstablishmentConfig {
    pub fn with_stagger_delay(mut self, delay: Duration) -> Self {
        self.stagger_delay = delay;
        self
    }

    pub fn with_establishment_timeout(mut self, timeout: Duration) -> Self {
        self.establishment_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_attempts(mut self, limit: usize) -> Self {
        self.max_concurrent_attempts = limit;
        self
    }

    pub fn with_receive_buffer(mut self, depth: usize) -> Self {
        self.receive_buffer = depth;
        self
    }

    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|err| TapsError::InvalidConfiguration {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.establishment_timeout.is_zero() {
            return Err(invalid("establishment_timeout must be greater than zero"));
        }
        if self.max_concurrent_attempts == 0 {
            return Err(invalid("max_concurrent_attempts must be greater than zero"));
        }
        if self.receive_buffer == 0 {
            return Err(invalid("receive_buffer must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(detail: &str) -> TapsError {
    TapsError::InvalidConfiguration {
        detail: detail.to_owned(),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
