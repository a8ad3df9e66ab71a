#![deny(unsafe_code)]
#![doc = r#"
# spark-taps-tcp

## 设计动机（Why）
- **定位**：为 `spark-taps` 连接建立引擎提供基于 Tokio 的真实网络后端：TCP 协议栈与系统解析器；
- **架构角色**：引擎只编排候选与竞速，本 crate 负责把一次拨号、监听或读写落到套接字上，
  并把 IO 失败映射为引擎可判读的 [`StackError`](spark_taps::StackError)。

## 核心契约（What）
- [`TcpStack`] 声明完全可靠与保序两项能力，不支持 0-RTT，不保留消息边界（由引擎分帧）；
- 所有挂起中的 IO 都感知取消令牌：竞速失败方的拨号、被销毁数据流的读写、被停止监听器的 accept
  都会尽快返回；
- [`SystemResolver`] 经由操作系统解析主机名，回环地址标注为回环接口。

## 实现策略（How）
- 读写半部经 `into_split` 拆开，各自由 `tokio::sync::Mutex` 串行化；
- 取消与 IO Future 通过带 `biased` 的 `tokio::select!` 组合，取消优先；
- 套接字选项（`TCP_NODELAY`、`SO_LINGER`、`SO_KEEPALIVE`）借助 `socket2::SockRef` 下发。

## 风险与考量（Trade-offs）
- 系统解析器不可取消，慢 DNS 只能由引擎的建立超时兜底；
- Rendezvous 的拨出连接不复用监听端口，无法完成 TCP 同时打开。
"#]

mod error;
mod flow;
mod listener;
mod resolver;
mod stack;
mod util;

pub use flow::TcpFlow;
pub use listener::TcpFlowListener;
pub use resolver::SystemResolver;
pub use stack::{TcpOptions, TcpStack};
