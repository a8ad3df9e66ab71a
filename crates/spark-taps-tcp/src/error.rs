use std::io;
use std::net::SocketAddr;

use spark_taps::StackError;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.taps.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.taps.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.taps.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.taps.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.taps.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.taps.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const CLOSED: OperationKind = OperationKind {
    code: "spark.taps.tcp.closed",
    message: "tcp flow",
};

/// 将 IO 错误映射为协议栈错误。
///
/// # 教案式说明
/// - **意图 (Why)**：竞速器只区分“拒绝”“不可达”“取消”与其余 IO 失败，
///   其余细节保留在稳定错误码与文案里供日志检索；
/// - **契约 (What)**：`peer` 为 `None` 时（监听、读写阶段）拒绝/不可达也退化为 `Io`。
pub(crate) fn map_io_error(kind: OperationKind, peer: Option<SocketAddr>, error: io::Error) -> StackError {
    use io::ErrorKind;
    match (error.kind(), peer) {
        (ErrorKind::ConnectionRefused, Some(peer)) => StackError::Refused {
            peer: peer.to_string(),
        },
        (ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable | ErrorKind::AddrNotAvailable, Some(peer)) => {
            StackError::Unreachable {
                peer: peer.to_string(),
            }
        }
        _ => StackError::Io {
            code: kind.code,
            detail: format!("{}: {}", kind.message, error),
        },
    }
}

/// 数据流已被本端销毁。
pub(crate) fn closed_error() -> StackError {
    StackError::Io {
        code: CLOSED.code,
        detail: format!("{} already destroyed", CLOSED.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connect_keeps_the_peer() {
        let peer: SocketAddr = "127.0.0.1:9".parse().expect("addr");
        let err = map_io_error(
            CONNECT,
            Some(peer),
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(
            err,
            StackError::Refused {
                peer: "127.0.0.1:9".into()
            }
        );
    }

    #[test]
    fn other_failures_carry_the_operation_code() {
        let err = map_io_error(WRITE, None, io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, StackError::Io { code: "spark.taps.tcp.write_failed", .. }));
    }
}
