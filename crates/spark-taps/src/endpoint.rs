//! # endpoint 模块说明
//!
//! ## 角色定位（Why）
//! - 以“可累积的不可变值”描述本地/远端端点：每次 `with_*` 追加一个备选项并返回新值，
//!   派生出的描述之间共享未修改的部分，互不影响；
//! - 远端与本地共用同一实现，通过零大小的角色标记在类型层面区分，避免把本地描述误传给远端参数。
//!
//! ## 数据结构（How）
//! - 内部是一条持久化单链表：新节点指向旧的链头，`Arc` 共享前缀，追加为 O(1)；
//! - 对外按插入顺序暴露备选项，保证候选枚举顺序可复现。

use std::fmt;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::{Result, TapsError};
use crate::parameters::InterfaceKind;

mod sealed {
    pub trait Sealed {}
}

/// 端点角色标记。
pub trait EndpointRole: sealed::Sealed + Send + Sync + 'static {
    const NAME: &'static str;
}

/// 远端角色。
#[derive(Debug)]
pub enum Remote {}

/// 本地角色。
#[derive(Debug)]
pub enum Local {}

impl sealed::Sealed for Remote {}
impl sealed::Sealed for Local {}

impl EndpointRole for Remote {
    const NAME: &'static str = "remote";
}

impl EndpointRole for Local {
    const NAME: &'static str = "local";
}

/// 端点描述中的单个备选项。
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum EndpointAlternative {
    Hostname(Arc<str>),
    Address(IpAddr),
    Port(u16),
    Service(Arc<str>),
    Interface(Arc<str>),
}

#[derive(Debug)]
struct Link {
    alternative: EndpointAlternative,
    parent: Option<Arc<Link>>,
}

/// 端点描述。
pub struct EndpointSpecifier<R: EndpointRole> {
    head: Option<Arc<Link>>,
    len: usize,
    _role: PhantomData<fn() -> R>,
}

pub type RemoteSpecifier = EndpointSpecifier<Remote>;
pub type LocalSpecifier = EndpointSpecifier<Local>;

impl<R: EndpointRole> Clone for EndpointSpecifier<R> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            len: self.len,
            _role: PhantomData,
        }
    }
}

impl<R: EndpointRole> Default for EndpointSpecifier<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: EndpointRole> fmt::Debug for EndpointSpecifier<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSpecifier")
            .field("role", &R::NAME)
            .field("alternatives", &self.alternatives())
            .finish()
    }
}

impl<R: EndpointRole> PartialEq for EndpointSpecifier<R> {
    fn eq(&self, other: &Self) -> bool {
        self.alternatives() == other.alternatives()
    }
}

impl<R: EndpointRole> Eq for EndpointSpecifier<R> {}

impl<R: EndpointRole> EndpointSpecifier<R> {
    pub fn new() -> Self {
        Self {
            head: None,
            len: 0,
            _role: PhantomData,
        }
    }

    fn push(&self, alternative: EndpointAlternative) -> Self {
        Self {
            head: Some(Arc::new(Link {
                alternative,
                parent: self.head.clone(),
            })),
            len: self.len + 1,
            _role: PhantomData,
        }
    }

    pub fn with_hostname(&self, hostname: impl AsRef<str>) -> Self {
        self.push(EndpointAlternative::Hostname(Arc::from(hostname.as_ref())))
    }

    pub fn with_address(&self, address: IpAddr) -> Self {
        self.push(EndpointAlternative::Address(address))
    }

    pub fn with_port(&self, port: u16) -> Self {
        self.push(EndpointAlternative::Port(port))
    }

    pub fn with_service(&self, service: impl AsRef<str>) -> Self {
        self.push(EndpointAlternative::Service(Arc::from(service.as_ref())))
    }

    /// 按插入顺序返回全部备选项。
    pub fn alternatives(&self) -> Vec<EndpointAlternative> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head.as_deref();
        while let Some(link) = cursor {
            out.push(link.alternative.clone());
            cursor = link.parent.as_deref();
        }
        out.reverse();
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn hostnames(&self) -> Vec<Arc<str>> {
        self.collect(|alt| match alt {
            EndpointAlternative::Hostname(name) => Some(name.clone()),
            _ => None,
        })
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.collect(|alt| match alt {
            EndpointAlternative::Address(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn services(&self) -> Vec<Arc<str>> {
        self.collect(|alt| match alt {
            EndpointAlternative::Service(name) => Some(name.clone()),
            _ => None,
        })
    }

    pub fn interfaces(&self) -> Vec<Arc<str>> {
        self.collect(|alt| match alt {
            EndpointAlternative::Interface(name) => Some(name.clone()),
            _ => None,
        })
    }

    /// 显式端口与服务名映射出的端口，按插入顺序去重。
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = Vec::new();
        for alt in self.alternatives() {
            let port = match alt {
                EndpointAlternative::Port(port) => Some(port),
                EndpointAlternative::Service(name) => well_known_port(&name),
                _ => None,
            };
            if let Some(port) = port
                && !ports.contains(&port)
            {
                ports.push(port);
            }
        }
        ports
    }

    /// 无需再解析即可得到具体地址：只含字面地址且端口已知。
    pub fn is_complete(&self) -> bool {
        !self.addresses().is_empty()
            && self.hostnames().is_empty()
            && self.interfaces().is_empty()
            && !self.ports().is_empty()
    }

    fn collect<T>(&self, pick: impl Fn(&EndpointAlternative) -> Option<T>) -> Vec<T> {
        self.alternatives().iter().filter_map(pick).collect()
    }

    fn check_common(&self) -> Result<()> {
        for alt in self.alternatives() {
            match alt {
                EndpointAlternative::Hostname(name) if name.trim().is_empty() => {
                    return Err(TapsError::malformed(format!("{} hostname is empty", R::NAME)));
                }
                EndpointAlternative::Service(name) if well_known_port(&name).is_none() => {
                    return Err(TapsError::malformed(format!(
                        "{} service `{name}` has no known port",
                        R::NAME
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl EndpointSpecifier<Remote> {
    /// 远端描述至少要有一个主机名或地址，以及一个非零端口（或可映射的服务名）。
    pub fn validate(&self) -> Result<()> {
        self.check_common()?;
        if !self.interfaces().is_empty() {
            return Err(TapsError::malformed("remote specifier cannot name an interface"));
        }
        if self.hostnames().is_empty() && self.addresses().is_empty() {
            return Err(TapsError::malformed(
                "remote specifier needs a hostname or an address",
            ));
        }
        let ports = self.ports();
        if ports.is_empty() {
            return Err(TapsError::malformed("remote specifier needs a port or a service"));
        }
        if ports.contains(&0) {
            return Err(TapsError::malformed("remote port 0 is not dialable"));
        }
        Ok(())
    }
}

impl EndpointSpecifier<Local> {
    pub fn with_interface(&self, interface: impl AsRef<str>) -> Self {
        self.push(EndpointAlternative::Interface(Arc::from(interface.as_ref())))
    }

    /// 本地描述可以为空（表示由系统选择）。
    pub fn validate(&self) -> Result<()> {
        self.check_common()?;
        if self.ports().len() > 1 {
            return Err(TapsError::malformed("local specifier may bind at most one port"));
        }
        Ok(())
    }
}

/// 解析完成的具体端点。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ConcreteEndpoint {
    pub addr: SocketAddr,
    pub interface: Option<InterfaceKind>,
}

impl ConcreteEndpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            interface: None,
        }
    }

    pub fn on_interface(mut self, interface: InterfaceKind) -> Self {
        self.interface = Some(interface);
        self
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl From<SocketAddr> for ConcreteEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for ConcreteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interface {
            Some(interface) => write!(f, "{}%{:?}", self.addr, interface),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// 常见服务名到端口的映射。
pub fn well_known_port(service: &str) -> Option<u16> {
    let port = match service.to_ascii_lowercase().as_str() {
        "ftp" => 21,
        "ssh" => 22,
        "telnet" => 23,
        "smtp" => 25,
        "domain" | "dns" => 53,
        "http" => 80,
        "ntp" => 123,
        "imap" => 143,
        "https" => 443,
        "submission" => 587,
        "imaps" => 993,
        "sip" => 5060,
        "sips" => 5061,
        _ => return None,
    };
    Some(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn derived_specifiers_do_not_alias() {
        let base = RemoteSpecifier::new().with_hostname("example.com");
        let https = base.with_port(443);
        let http = base.with_service("http");
        assert_eq!(base.len(), 1);
        assert_eq!(https.ports(), vec![443]);
        assert_eq!(http.ports(), vec![80]);
    }

    #[test]
    fn alternatives_keep_insertion_order() {
        let spec = RemoteSpecifier::new()
            .with_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_hostname("a")
            .with_port(1);
        assert_eq!(
            spec.alternatives(),
            vec![
                EndpointAlternative::Address(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                EndpointAlternative::Hostname(Arc::from("a")),
                EndpointAlternative::Port(1),
            ]
        );
        assert!(!spec.is_complete());
    }

    #[test]
    fn remote_without_host_is_malformed() {
        let err = RemoteSpecifier::new().with_port(80).validate().unwrap_err();
        assert_eq!(err.code(), "spark.taps.malformed_specifier");
    }

    #[test]
    fn unknown_service_is_malformed() {
        let err = RemoteSpecifier::new()
            .with_hostname("h")
            .with_service("gopher-plus")
            .validate()
            .unwrap_err();
        assert!(matches!(err, TapsError::MalformedSpecifier { .. }));
    }

    #[test]
    fn empty_local_is_valid() {
        assert!(LocalSpecifier::new().validate().is_ok());
    }
}
