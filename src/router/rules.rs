use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use serde::Serialize;

use super::geoip::GeoIpLookup;
use super::metadata::RequestMetadata;
use super::provider::RuleSet;

/// 规则谓词
pub enum RuleKind {
    /// 域名完全匹配（小写）
    Domain(String),
    /// 域名后缀匹配，按点边界（小写）
    DomainSuffix(String),
    /// 域名关键字匹配（小写）
    DomainKeyword(String),
    IpCidr { net: IpNet, no_resolve: bool },
    GeoIp {
        country: String,
        no_resolve: bool,
        db: Arc<dyn GeoIpLookup>,
    },
    /// 进程名；含路径分隔符时按完整路径匹配
    ProcessName(String),
    /// "tcp" / "udp"，匹配同一协议族
    Protocol(String),
    DestPort(u16),
    And(Vec<RuleKind>),
    RuleSet(Arc<RuleSet>),
    Final,
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::Domain(_) => "DOMAIN",
            RuleKind::DomainSuffix(_) => "DOMAIN-SUFFIX",
            RuleKind::DomainKeyword(_) => "DOMAIN-KEYWORD",
            RuleKind::IpCidr { .. } => "IP-CIDR",
            RuleKind::GeoIp { .. } => "GEOIP",
            RuleKind::ProcessName(_) => "PROCESS-NAME",
            RuleKind::Protocol(_) => "PROTOCOL",
            RuleKind::DestPort(_) => "DEST-PORT",
            RuleKind::And(_) => "AND",
            RuleKind::RuleSet(_) => "RULE-SET",
            RuleKind::Final => "FINAL",
        }
    }

    pub fn matches(&self, meta: &RequestMetadata) -> bool {
        match self {
            RuleKind::Domain(domain) => !meta.host.is_empty() && meta.host.eq_ignore_ascii_case(domain),
            RuleKind::DomainSuffix(suffix) => suffix_match(&meta.host, suffix),
            RuleKind::DomainKeyword(keyword) => contains_ignore_case(&meta.host, keyword),
            RuleKind::IpCidr { net, .. } => match meta.ip.or(meta.dns_ip) {
                // ::ffff:a.b.c.d 同时按 IPv4 匹配
                Some(ip) => net.contains(&ip) || net.contains(&ip.to_canonical()),
                None => false,
            },
            RuleKind::GeoIp {
                country,
                no_resolve,
                db,
            } => {
                let ip = match (meta.ip, *no_resolve) {
                    (Some(ip), _) => ip,
                    (None, false) => match meta.dns_ip {
                        Some(ip) => ip,
                        None => return false,
                    },
                    (None, true) => return false,
                };
                if !db.is_initialized() {
                    return false;
                }
                match db.lookup_country(ip.to_canonical()) {
                    Ok(code) => code.eq_ignore_ascii_case(country),
                    Err(_) => false,
                }
            }
            RuleKind::ProcessName(expected) => match meta.process_path.as_deref() {
                Some(path) if !path.is_empty() => {
                    if expected.contains(['/', '\\']) {
                        eq_fold(path, expected)
                    } else {
                        let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
                        eq_fold(base, expected)
                    }
                }
                _ => false,
            },
            RuleKind::Protocol(proto) => match proto.as_str() {
                "tcp" | "udp" => {
                    meta.network.len() >= proto.len()
                        && meta.network.as_bytes()[..proto.len()].eq_ignore_ascii_case(proto.as_bytes())
                }
                _ => meta.network.eq_ignore_ascii_case(proto),
            },
            RuleKind::DestPort(port) => meta.port == *port,
            RuleKind::And(children) => children.iter().all(|c| c.matches(meta)),
            RuleKind::RuleSet(set) => set.matches(meta),
            RuleKind::Final => true,
        }
    }
}

impl fmt::Debug for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::Domain(v)
            | RuleKind::DomainSuffix(v)
            | RuleKind::DomainKeyword(v)
            | RuleKind::ProcessName(v)
            | RuleKind::Protocol(v) => write!(f, "{}({})", self.type_name(), v),
            RuleKind::IpCidr { net, no_resolve } => {
                write!(f, "IP-CIDR({}, no_resolve={})", net, no_resolve)
            }
            RuleKind::GeoIp {
                country, no_resolve, ..
            } => write!(f, "GEOIP({}, no_resolve={})", country, no_resolve),
            RuleKind::DestPort(p) => write!(f, "DEST-PORT({})", p),
            RuleKind::And(children) => f.debug_tuple("AND").field(children).finish(),
            RuleKind::RuleSet(set) => write!(f, "RULE-SET({})", set.source()),
            RuleKind::Final => f.write_str("FINAL"),
        }
    }
}

/// `host` 等于 `suffix` 或以 "." + suffix 结尾（忽略 ASCII 大小写）
fn suffix_match(host: &str, suffix: &str) -> bool {
    let h = host.as_bytes();
    let s = suffix.as_bytes();
    if h.is_empty() || s.is_empty() || h.len() < s.len() {
        return false;
    }
    let tail = &h[h.len() - s.len()..];
    if !tail.eq_ignore_ascii_case(s) {
        return false;
    }
    h.len() == s.len() || h[h.len() - s.len() - 1] == b'.'
}

fn contains_ignore_case(host: &str, keyword: &str) -> bool {
    let h = host.as_bytes();
    let k = keyword.as_bytes();
    if h.is_empty() || k.len() > h.len() {
        return false;
    }
    if k.is_empty() {
        return true;
    }
    h.windows(k.len()).any(|w| w.eq_ignore_ascii_case(k))
}

/// Unicode 大小写无关比较，不分配
fn eq_fold(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

/// 一条规则：谓词 + 策略名 + 运行时状态
pub struct Rule {
    kind: RuleKind,
    payload: String,
    policy: String,
    no_resolve: bool,
    enabled: AtomicBool,
    hits: AtomicU64,
    comment: String,
}

impl Rule {
    pub fn new(kind: RuleKind, payload: impl Into<String>, policy: impl Into<String>, no_resolve: bool) -> Self {
        Self {
            kind,
            payload: payload.into(),
            policy: policy.into(),
            no_resolve,
            enabled: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            comment: String::new(),
        }
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        self.enabled.store(enabled, Ordering::Relaxed);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn rule_type(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn no_resolve(&self) -> bool {
        self.no_resolve
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_hits(&self) {
        self.hits.store(0, Ordering::Relaxed);
    }

    pub fn matches(&self, meta: &RequestMetadata) -> bool {
        self.kind.matches(meta)
    }

    pub fn snapshot(&self, index: usize) -> RuleSnapshot {
        RuleSnapshot {
            index,
            rule_type: self.rule_type().to_string(),
            payload: self.payload.clone(),
            policy: self.policy.clone(),
            no_resolve: self.no_resolve,
            enabled: self.is_enabled(),
            hits: self.hits(),
            comment: self.comment.clone(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RuleKind::Final => write!(f, "FINAL,{}", self.policy),
            _ => write!(f, "{},{},{}", self.rule_type(), self.payload, self.policy),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .field("enabled", &self.is_enabled())
            .field("hits", &self.hits())
            .finish()
    }
}

/// 规则状态快照（非实时视图）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSnapshot {
    pub index: usize,
    pub rule_type: String,
    pub payload: String,
    pub policy: String,
    pub no_resolve: bool,
    pub enabled: bool,
    pub hits: u64,
    pub comment: String,
}
