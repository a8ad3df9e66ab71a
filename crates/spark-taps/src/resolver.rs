use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::endpoint::{ConcreteEndpoint, LocalSpecifier, RemoteSpecifier};
use crate::error::{Result, TapsError};
use crate::parameters::InterfaceKind;

/// 名字解析适配器：把端点描述展开为具体地址。
///
/// # 教案式说明
/// - **意图 (Why)**：核心不关心解析算法（DNS、mDNS、静态表），只要求按描述的插入顺序返回具体端点；
/// - **契约 (What)**：
///   - 失败返回 [`TapsError::ResolutionFailure`]，由候选生成器转为异步事件；
///   - `resolve_local` 返回空列表表示“未指定本地端点”，由系统选择；
/// - **风险 (Trade-offs)**：同一描述可能被多次解析（例如 Rendezvous 同时拨号与监听），实现应当廉价或自行缓存。
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve_remote(&self, remote: &RemoteSpecifier) -> Result<Vec<ConcreteEndpoint>>;

    async fn resolve_local(&self, local: &LocalSpecifier) -> Result<Vec<ConcreteEndpoint>>;
}

#[derive(Clone, Debug)]
struct InterfaceEntry {
    kind: InterfaceKind,
    addresses: Vec<IpAddr>,
}

/// 基于静态表的解析器。
///
/// 字面地址直接通过；`localhost` 内置为 `::1` 与 `127.0.0.1`；其余主机名与接口名查表。
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    hosts: Arc<RwLock<HashMap<String, Vec<IpAddr>>>>,
    interfaces: Arc<RwLock<HashMap<String, InterfaceEntry>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, name: impl Into<String>, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        self.hosts
            .write()
            .entry(name.into().to_ascii_lowercase())
            .or_default()
            .extend(addresses);
        self
    }

    pub fn with_interface(
        self,
        name: impl Into<String>,
        kind: InterfaceKind,
        addresses: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        self.interfaces.write().insert(
            name.into(),
            InterfaceEntry {
                kind,
                addresses: addresses.into_iter().collect(),
            },
        );
        self
    }

    fn lookup_host(&self, name: &str) -> Option<Vec<IpAddr>> {
        let key = name.to_ascii_lowercase();
        if let Some(found) = self.hosts.read().get(&key) {
            return Some(found.clone());
        }
        if key == "localhost" {
            return Some(vec![
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
            ]);
        }
        name.parse::<IpAddr>().ok().map(|addr| vec![addr])
    }

    fn interface_kind_of(&self, addr: IpAddr) -> Option<InterfaceKind> {
        if addr.is_loopback() {
            return Some(InterfaceKind::Loopback);
        }
        self.interfaces
            .read()
            .values()
            .find(|entry| entry.addresses.contains(&addr))
            .map(|entry| entry.kind)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve_remote(&self, remote: &RemoteSpecifier) -> Result<Vec<ConcreteEndpoint>> {
        let mut hosts: Vec<IpAddr> = remote.addresses();
        for name in remote.hostnames() {
            let found = self.lookup_host(&name).ok_or_else(|| TapsError::ResolutionFailure {
                endpoint: name.to_string(),
                detail: "host not present in the static table".into(),
            })?;
            hosts.extend(found);
        }
        Ok(cross(&hosts, &remote.ports(), |_| None))
    }

    async fn resolve_local(&self, local: &LocalSpecifier) -> Result<Vec<ConcreteEndpoint>> {
        if local.is_empty() {
            return Ok(Vec::new());
        }
        let mut hosts = local.addresses();
        let mut kinds: HashMap<IpAddr, InterfaceKind> = HashMap::new();
        for name in local.interfaces() {
            let table = self.interfaces.read();
            let entry = table.get(name.as_ref()).ok_or_else(|| TapsError::ResolutionFailure {
                endpoint: name.to_string(),
                detail: "unknown local interface".into(),
            })?;
            for addr in &entry.addresses {
                kinds.insert(*addr, entry.kind);
                hosts.push(*addr);
            }
        }
        for name in local.hostnames() {
            hosts.extend(self.lookup_host(&name).ok_or_else(|| TapsError::ResolutionFailure {
                endpoint: name.to_string(),
                detail: "host not present in the static table".into(),
            })?);
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
        Ok(cross(&hosts, &ports, |addr| {
            kinds
                .get(&addr)
                .copied()
                .or_else(|| self.interface_kind_of(addr))
        }))
    }
}

fn cross(
    hosts: &[IpAddr],
    ports: &[u16],
    kind_of: impl Fn(IpAddr) -> Option<InterfaceKind>,
) -> Vec<ConcreteEndpoint> {
    let mut out = Vec::with_capacity(hosts.len() * ports.len());
    for host in hosts {
        for port in ports {
            let endpoint = ConcreteEndpoint {
                addr: SocketAddr::new(*host, *port),
                interface: kind_of(*host),
            };
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
    async fn unknown_hosts_fail_resolution() {
        let resolver = StaticResolver::new();
        let remote = RemoteSpecifier::new().with_hostname("nowhere.invalid").with_port(1);
        let err = resolver.resolve_remote(&remote).await.unwrap_err();
        assert_eq!(err.code(), "spark.taps.resolution_failure");
    }

    #[tokio::test]
    async fn interfaces_carry_their_kind() {
        let wifi: IpAddr = "192.168.1.20".parse().expect("addr");
        let resolver = StaticResolver::new().with_interface("wlan0", InterfaceKind::Wifi, [wifi]);
        let local = LocalSpecifier::new().with_interface("wlan0");
        let resolved = resolver.resolve_local(&local).await.expect("resolve");
        assert_eq!(resolved, vec![ConcreteEndpoint::new(SocketAddr::new(wifi, 0)).on_interface(InterfaceKind::Wifi)]);
    }

    #[tokio::test]
    async fn empty_local_is_unspecified() {
        let resolved = StaticResolver::new()
            .resolve_local(&LocalSpecifier::new())
            .await
            .expect("resolve");
        assert!(resolved.is_empty());
    }
}
