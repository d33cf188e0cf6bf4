use std::net::IpAddr;

use crate::common::Address;
use crate::proxy::Network;

/// 一次连接请求的匹配输入
///
/// 由调用方按连接构造，匹配期间只读。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    /// 网络类型，如 "tcp"、"udp"、"tcp6"
    pub network: String,
    /// 目标域名或 IP 字面量
    pub host: String,
    /// host 为 IP 字面量时的解析结果
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub process_path: Option<String>,
    pub source_ip: Option<IpAddr>,
    pub source_port: Option<u16>,
    /// 调用方预先解析出的 IP
    pub dns_ip: Option<IpAddr>,
}

impl RequestMetadata {
    pub fn new(network: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let ip = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .ok();
        Self {
            network: network.into(),
            host,
            ip,
            port,
            ..Default::default()
        }
    }

    pub fn from_address(network: Network, target: &Address) -> Self {
        match target {
            Address::Ip(addr) => Self {
                network: network.as_str().to_string(),
                host: addr.ip().to_string(),
                ip: Some(addr.ip()),
                port: addr.port(),
                ..Default::default()
            },
            Address::Domain(domain, port) => Self::new(network.as_str(), domain.as_str(), *port),
        }
    }

    pub fn with_process(mut self, path: impl Into<String>) -> Self {
        self.process_path = Some(path.into());
        self
    }

    pub fn with_source(mut self, ip: IpAddr, port: u16) -> Self {
        self.source_ip = Some(ip);
        self.source_port = Some(port);
        self
    }

    pub fn with_dns_ip(mut self, ip: IpAddr) -> Self {
        self.dns_ip = Some(ip);
        self
    }

    /// 供拨号使用的目标地址
    pub fn destination(&self) -> Address {
        match self.ip {
            Some(ip) => Address::Ip(std::net::SocketAddr::new(ip, self.port)),
            None => Address::Domain(self.host.clone(), self.port),
        }
    }
}
