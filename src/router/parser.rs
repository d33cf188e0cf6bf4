use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ipnet::IpNet;

use crate::common::RouterError;
use crate::config::types::RuleRecord;

use super::geoip::GeoIpLookup;
use super::provider::{RuleSet, DEFAULT_FETCH_TIMEOUT};
use super::rules::{Rule, RuleKind};

/// 规则文本解析器
///
/// 行格式：`TYPE,PAYLOAD,POLICY[,no-resolve]`，终结规则为 `FINAL,POLICY`（`MATCH` 同义）。
/// GEOIP 规则与 RULE-SET 规则需要的外部协作者由解析器持有并注入。
pub struct RuleParser {
    geoip: Arc<dyn GeoIpLookup>,
    fetch_timeout: Duration,
}

impl RuleParser {
    pub fn new(geoip: Arc<dyn GeoIpLookup>) -> Self {
        Self {
            geoip,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// 解析一行规则；空行与注释返回 `None`
    pub fn parse_line(&self, line: &str) -> Result<Option<Rule>> {
        let line = line.trim();
        if is_comment(line) {
            return Ok(None);
        }

        let parts = split_rule_line(line);
        let rule_type = parts[0].to_ascii_uppercase();

        if is_final(&rule_type) {
            let policy = parts.get(1).copied().unwrap_or_default();
            if policy.is_empty() {
                return Err(config_err(format!("missing policy: {}", line)));
            }
            return Ok(Some(Rule::new(RuleKind::Final, "", policy, false)));
        }

        if parts.len() < 3 || parts[2].is_empty() {
            return Err(config_err(format!("invalid rule format: {}", line)));
        }
        let payload = parts[1];
        let no_resolve = has_no_resolve(&parts[3..]);
        let kind = self.build_kind(&rule_type, payload, no_resolve, true)?;
        Ok(Some(Rule::new(kind, payload, parts[2], no_resolve)))
    }

    /// 解析结构化规则记录
    pub fn parse_record(&self, record: &RuleRecord) -> Result<Rule> {
        let rule_type = record.rule_type.trim().to_ascii_uppercase();
        let policy = record.policy.trim();
        if policy.is_empty() {
            return Err(config_err(format!("rule {} has no policy", rule_type)));
        }
        let payload = record.value.trim();
        let no_resolve = record.no_resolve || has_no_resolve_owned(&record.params);

        let kind = if is_final(&rule_type) {
            RuleKind::Final
        } else {
            self.build_kind(&rule_type, payload, no_resolve, true)?
        };
        let payload = if matches!(kind, RuleKind::Final) { "" } else { payload };

        Ok(Rule::new(kind, payload, policy, no_resolve)
            .with_enabled(record.enabled)
            .with_comment(record.comment.as_str()))
    }

    /// 解析规则集中的一行：只有 `TYPE,PAYLOAD`，策略来自引用它的 RULE-SET 规则
    ///
    /// 第三段若是 `no-resolve` 视为选项，其余内容（如遗留的策略名）忽略。
    pub fn parse_member(&self, line: &str) -> Result<Option<RuleKind>> {
        let line = line.trim();
        if is_comment(line) {
            return Ok(None);
        }
        let parts = split_rule_line(line);
        if parts.len() < 2 || parts[1].is_empty() {
            return Err(config_err(format!("invalid rule-set line: {}", line)));
        }
        let rule_type = parts[0].to_ascii_uppercase();
        if is_final(&rule_type) {
            return Err(config_err("FINAL is not allowed inside a rule-set"));
        }
        let no_resolve = has_no_resolve(&parts[2..]);
        self.build_kind(&rule_type, parts[1], no_resolve, false).map(Some)
    }

    fn build_kind(
        &self,
        rule_type: &str,
        payload: &str,
        no_resolve: bool,
        allow_rule_set: bool,
    ) -> Result<RuleKind> {
        if payload.is_empty() {
            return Err(config_err(format!("{} rule has empty payload", rule_type)));
        }
        let kind = match rule_type {
            "DOMAIN" => RuleKind::Domain(payload.to_ascii_lowercase()),
            "DOMAIN-SUFFIX" => RuleKind::DomainSuffix(payload.to_ascii_lowercase()),
            "DOMAIN-KEYWORD" => RuleKind::DomainKeyword(payload.to_ascii_lowercase()),
            "IP-CIDR" | "IP-CIDR6" => RuleKind::IpCidr {
                net: parse_cidr(payload)?,
                no_resolve,
            },
            "GEOIP" => RuleKind::GeoIp {
                country: payload.to_ascii_uppercase(),
                no_resolve,
                db: self.geoip.clone(),
            },
            "PROCESS-NAME" => RuleKind::ProcessName(payload.to_string()),
            "PROTOCOL" => RuleKind::Protocol(payload.to_ascii_lowercase()),
            "DEST-PORT" => RuleKind::DestPort(
                payload
                    .parse()
                    .map_err(|_| config_err(format!("invalid port: {}", payload)))?,
            ),
            "AND" => self.parse_and(payload)?,
            "RULE-SET" if allow_rule_set => RuleKind::RuleSet(Arc::new(RuleSet::new(
                payload,
                self.geoip.clone(),
                self.fetch_timeout,
            )?)),
            "RULE-SET" => {
                return Err(config_err("RULE-SET cannot be nested"));
            }
            other => return Err(config_err(format!("unknown rule type: {}", other))),
        };
        Ok(kind)
    }

    /// `((TYPE,VALUE),(TYPE,VALUE))`，子规则不带策略
    fn parse_and(&self, payload: &str) -> Result<RuleKind> {
        let inner = strip_parens(payload)
            .ok_or_else(|| config_err(format!("invalid AND payload: {}", payload)))?;
        let items = if inner.starts_with('(') {
            split_rule_line(inner)
        } else {
            vec![payload]
        };

        let mut children = Vec::with_capacity(items.len());
        for item in items {
            if item.is_empty() {
                continue;
            }
            let tuple = strip_parens(item)
                .ok_or_else(|| config_err(format!("invalid AND sub-rule: {}", item)))?;
            let parts = split_rule_line(tuple);
            if parts.len() < 2 {
                return Err(config_err(format!("invalid AND sub-rule: {}", item)));
            }
            let rule_type = parts[0].to_ascii_uppercase();
            if is_final(&rule_type) {
                return Err(config_err("FINAL is not allowed inside AND"));
            }
            let no_resolve = has_no_resolve(&parts[2..]);
            children.push(self.build_kind(&rule_type, parts[1], no_resolve, false)?);
        }

        if children.is_empty() {
            return Err(config_err(format!("AND rule has no sub-rules: {}", payload)));
        }
        Ok(RuleKind::And(children))
    }
}

/// 按顶层逗号切分，括号内的逗号不切；每段去掉首尾空白
pub fn split_rule_line(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(line[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(line[start..].trim());
    parts
}

fn strip_parens(s: &str) -> Option<&str> {
    s.trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .map(str::trim)
}

fn parse_cidr(payload: &str) -> Result<IpNet> {
    if let Ok(net) = payload.parse::<IpNet>() {
        return Ok(net);
    }
    payload
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| config_err(format!("invalid CIDR: {}", payload)))
}

fn is_comment(line: &str) -> bool {
    line.is_empty() || line.starts_with('#') || line.starts_with("//")
}

fn is_final(rule_type: &str) -> bool {
    rule_type == "FINAL" || rule_type == "MATCH"
}

fn has_no_resolve(options: &[&str]) -> bool {
    options.iter().any(|o| o.eq_ignore_ascii_case("no-resolve"))
}

fn has_no_resolve_owned(options: &[String]) -> bool {
    options.iter().any(|o| o.trim().eq_ignore_ascii_case("no-resolve"))
}

fn config_err(msg: impl Into<String>) -> anyhow::Error {
    RouterError::Config(msg.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RouterErrorKind;
    use crate::router::geoip::GeoIpDb;
    use crate::router::metadata::RequestMetadata;

    fn parser() -> RuleParser {
        RuleParser::new(Arc::new(GeoIpDb::uninitialized()))
    }

    #[test]
    fn split_respects_parentheses() {
        assert_eq!(
            split_rule_line("AND,((DOMAIN,a.com),(DEST-PORT,443)),Proxy"),
            vec!["AND", "((DOMAIN,a.com),(DEST-PORT,443))", "Proxy"]
        );
        assert_eq!(split_rule_line(" A , b ,c"), vec!["A", "b", "c"]);
    }

    #[test]
    fn comments_and_blank_lines() {
        let p = parser();
        assert!(p.parse_line("").unwrap().is_none());
        assert!(p.parse_line("# note").unwrap().is_none());
        assert!(p.parse_line("// note").unwrap().is_none());
    }

    #[test]
    fn basic_lines() {
        let p = parser();
        let r = p.parse_line("domain-suffix,Google.com,Proxy").unwrap().unwrap();
        assert_eq!(r.rule_type(), "DOMAIN-SUFFIX");
        assert_eq!(r.policy(), "Proxy");
        assert!(r.matches(&RequestMetadata::new("tcp", "mail.google.com", 443)));

        let r = p.parse_line("IP-CIDR,192.168.0.0/16,DIRECT,no-resolve").unwrap().unwrap();
        assert!(r.no_resolve());
        assert!(r.matches(&RequestMetadata::new("tcp", "192.168.1.1", 80)));

        let r = p.parse_line("IP-CIDR6,2001:db8::1,DIRECT").unwrap().unwrap();
        assert!(matches!(r.kind(), RuleKind::IpCidr { net, .. } if net.prefix_len() == 128));

        let r = p.parse_line("MATCH,Proxy").unwrap().unwrap();
        assert_eq!(r.rule_type(), "FINAL");
        assert_eq!(r.policy(), "Proxy");
    }

    #[test]
    fn malformed_lines_are_config_errors() {
        let p = parser();
        for line in [
            "DOMAIN,example.com",
            "FINAL",
            "IP-CIDR,not-an-ip,DIRECT",
            "DEST-PORT,99999,DIRECT",
            "UNKNOWN,x,DIRECT",
            "AND,(),Proxy",
        ] {
            let err = p.parse_line(line).err().unwrap();
            assert_eq!(RouterError::classify(&err), RouterErrorKind::Config, "{}", line);
        }
    }

    #[test]
    fn and_rule_parses_sub_rules() {
        let p = parser();
        let r = p
            .parse_line("AND,((PROTOCOL,UDP),(DEST-PORT,443)),REJECT")
            .unwrap()
            .unwrap();
        assert_eq!(r.rule_type(), "AND");
        assert!(r.matches(&RequestMetadata::new("udp", "x.com", 443)));
        assert!(!r.matches(&RequestMetadata::new("tcp", "x.com", 443)));

        let nested = p
            .parse_line("AND,((DOMAIN-SUFFIX,a.com),(AND,((DEST-PORT,80),(PROTOCOL,TCP)))),Proxy")
            .unwrap()
            .unwrap();
        assert!(nested.matches(&RequestMetadata::new("tcp", "www.a.com", 80)));
        assert!(!nested.matches(&RequestMetadata::new("tcp", "www.a.com", 81)));
    }

    #[test]
    fn member_lines_have_no_policy() {
        let p = parser();
        let kind = p.parse_member("DOMAIN-KEYWORD,ads").unwrap().unwrap();
        assert!(kind.matches(&RequestMetadata::new("tcp", "ads.example.com", 443)));

        let kind = p.parse_member("IP-CIDR,10.0.0.0/8,no-resolve").unwrap().unwrap();
        assert!(matches!(kind, RuleKind::IpCidr { no_resolve: true, .. }));

        assert!(p.parse_member("RULE-SET,https://x/y.list").is_err());
        assert!(p.parse_member("DOMAIN").is_err());
    }

    #[test]
    fn record_carries_state() {
        let p = parser();
        let record = RuleRecord {
            rule_type: "ip-cidr".into(),
            value: "10.0.0.0/8".into(),
            policy: "DIRECT".into(),
            params: vec!["no-resolve".into()],
            no_resolve: false,
            enabled: false,
            comment: "lan".into(),
        };
        let r = p.parse_record(&record).unwrap();
        assert!(r.no_resolve());
        assert!(!r.is_enabled());
        assert_eq!(r.comment(), "lan");

        let fin = RuleRecord {
            rule_type: "FINAL".into(),
            value: String::new(),
            policy: "Proxy".into(),
            params: Vec::new(),
            no_resolve: false,
            enabled: true,
            comment: String::new(),
        };
        assert_eq!(p.parse_record(&fin).unwrap().rule_type(), "FINAL");
    }
}
