use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use spark_taps::parameters::InterfaceKind;
use spark_taps::{ConcreteEndpoint, LocalSpecifier, RemoteSpecifier, Resolver, Result, TapsError};
use tracing::debug;

/// 借助操作系统解析器（`getaddrinfo`）展开主机名的解析器。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 字面地址原样通过，主机名按系统返回顺序展开，结果与端口做笛卡尔积并去重；
///   - 回环地址标注为 [`InterfaceKind::Loopback`]，其余地址不标注接口类型；
///   - 系统接口枚举不在本解析器的能力范围内，带接口名的本地描述返回解析失败；
/// - **风险 (Trade-offs)**：系统解析器不可取消，超时由核心的建立截止时间兜底。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> Self {
        Self
    }

    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>> {
        if let Ok(addr) = name.parse::<IpAddr>() {
            return Ok(vec![addr]);
        }
        let found = tokio::net::lookup_host((name, 0))
            .await
            .map_err(|err| TapsError::ResolutionFailure {
                endpoint: name.to_owned(),
                detail: err.to_string(),
            })?;
        let mut hosts = Vec::new();
        for addr in found {
            if !hosts.contains(&addr.ip()) {
                hosts.push(addr.ip());
            }
        }
        if hosts.is_empty() {
            return Err(TapsError::ResolutionFailure {
                endpoint: name.to_owned(),
                detail: "no addresses returned".into(),
            });
        }
        debug!(host = name, count = hosts.len(), "host resolved");
        Ok(hosts)
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve_remote(&self, remote: &RemoteSpecifier) -> Result<Vec<ConcreteEndpoint>> {
        let mut hosts = remote.addresses();
        for name in remote.hostnames() {
            hosts.extend(self.lookup(&name).await?);
        }
        Ok(cross(&hosts, &remote.ports()))
    }

    async fn resolve_local(&self, local: &LocalSpecifier) -> Result<Vec<ConcreteEndpoint>> {
        if local.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(name) = local.interfaces().first() {
            return Err(TapsError::ResolutionFailure {
                endpoint: name.to_string(),
                detail: "interface lookup is not supported by the system resolver".into(),
            });
        }
        let mut hosts = local.addresses();
        for name in local.hostnames() {
            hosts.extend(self.lookup(&name).await?);
        }
        if hosts.is_empty() {
            hosts = vec![
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ];
        }
        let mut ports = local.ports();
        if ports.is_empty() {
            ports.push(0);
        }
        Ok(cross(&hosts, &ports))
    }
}

fn cross(hosts: &[IpAddr], ports: &[u16]) -> Vec<ConcreteEndpoint> {
    let mut out = Vec::with_capacity(hosts.len() * ports.len());
    for host in hosts {
        for port in ports {
            let mut endpoint = ConcreteEndpoint::new(SocketAddr::new(*host, *port));
            if host.is_loopback() {
                endpoint = endpoint.on_interface(InterfaceKind::Loopback);
            }
            if !out.contains(&endpoint) {
                out.push(endpoint);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_pass_through() {
        let remote = RemoteSpecifier::new()
            .with_hostname("127.0.0.1")
            .with_address("192.0.2.1".parse().expect("addr"))
            .with_port(80);
        let resolved = SystemResolver::new().resolve_remote(&remote).await.expect("resolve");
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|endpoint| endpoint.addr.port() == 80));
        let loopback = resolved
            .iter()
            .find(|endpoint| endpoint.addr.ip().is_loopback())
            .expect("loopback");
        assert_eq!(loopback.interface, Some(InterfaceKind::Loopback));
    }

    #[tokio::test]
    async fn port_only_local_binds_the_unspecified_addresses() {
        let resolved = SystemResolver::new()
            .resolve_local(&LocalSpecifier::new().with_port(9000))
            .await
            .expect("resolve");
        let addrs: Vec<SocketAddr> = resolved.iter().map(|endpoint| endpoint.addr).collect();
        assert_eq!(addrs, vec!["[::]:9000".parse().expect("v6"), "0.0.0.0:9000".parse().expect("v4")]);
    }

    #[tokio::test]
    async fn interfaces_are_not_resolved() {
        let err = SystemResolver::new()
            .resolve_local(&LocalSpecifier::new().with_interface("eth0"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "spark.taps.resolution_failure");
    }
}
