use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::common::RouterError;
use crate::proxy::is_reserved;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    /// mmdb 路径；缺省时 GEOIP 规则一律不命中
    #[serde(default)]
    pub geoip_db: Option<String>,
    /// 无规则命中时使用的策略
    #[serde(default = "default_policy")]
    pub default_policy: String,
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// RULE-SET 刷新间隔（秒）
    #[serde(default = "default_update_interval")]
    pub rule_set_interval: u64,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub proxy_groups: Vec<ProxyGroupConfig>,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

impl Config {
    /// 结构校验：名称唯一、不占用保留字，规则策略与静态成员都能找到
    ///
    /// 组成员的环路检测在构建阶段进行。
    pub fn validate(&self) -> Result<()> {
        let mut names: HashSet<&str> = HashSet::new();
        for name in self
            .proxies
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.proxy_groups.iter().map(|g| g.name.as_str()))
        {
            if name.is_empty() {
                return Err(RouterError::Config("proxy/group name must not be empty".into()).into());
            }
            if is_reserved(name) {
                return Err(RouterError::Config(format!("'{}' is a reserved name", name)).into());
            }
            if !names.insert(name) {
                return Err(RouterError::Config(format!("duplicate proxy/group name '{}'", name)).into());
            }
        }

        let known = |name: &str| is_reserved(name) || names.contains(name);

        for group in &self.proxy_groups {
            for member in &group.proxies {
                if !known(member) {
                    return Err(RouterError::Config(format!(
                        "proxy-group '{}' references unknown member '{}'",
                        group.name, member
                    ))
                    .into());
                }
            }
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if let Some(policy) = rule.policy() {
                if !known(policy) {
                    return Err(RouterError::Config(format!(
                        "rule #{} references unknown policy '{}'",
                        i, policy
                    ))
                    .into());
                }
            }
        }

        if !known(&self.default_policy) {
            return Err(RouterError::Config(format!(
                "default-policy '{}' does not match any proxy or group",
                self.default_policy
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_policy() -> String {
    "DIRECT".to_string()
}

fn default_test_timeout_ms() -> u64 {
    5000
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_update_interval() -> u64 {
    86400
}

fn default_group_interval() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// 叶子代理
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProxyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 协议相关的附加参数
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// 代理组
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyGroupConfig {
    pub name: String,
    /// select / url-test / smart / relay
    #[serde(rename = "type")]
    pub group_type: String,
    #[serde(default)]
    pub proxies: Vec<String>,
    /// 测速 URL
    #[serde(default)]
    pub url: Option<String>,
    /// 测速间隔（秒），0 表示只在成员变化或手动触发时测速
    #[serde(default = "default_group_interval")]
    pub interval: u64,
    /// url-test 切换容差（毫秒）
    #[serde(default)]
    pub tolerance: u64,
    /// 订阅地址；设置后成员由订阅维护
    #[serde(default)]
    pub policy_path: Option<String>,
    #[serde(default)]
    pub policy_regex_filter: Option<String>,
    #[serde(default)]
    pub include_all_proxies: bool,
    #[serde(default)]
    pub evaluate_before_use: bool,
    /// select 组的初始选择
    #[serde(default)]
    pub selected: Option<String>,
    /// 订阅刷新间隔（秒）
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
}

/// 规则条目：规则行字符串或结构化记录
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RuleEntry {
    Line(String),
    Record(RuleRecord),
}

impl RuleEntry {
    /// 条目引用的策略名；空行、注释或无法识别时为 `None`
    pub fn policy(&self) -> Option<&str> {
        match self {
            RuleEntry::Record(r) => Some(r.policy.trim()),
            RuleEntry::Line(line) => {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                    return None;
                }
                let parts = crate::router::parser::split_rule_line(line);
                let idx = match parts[0].to_ascii_uppercase().as_str() {
                    "FINAL" | "MATCH" => 1,
                    _ => 2,
                };
                parts.get(idx).copied().filter(|p| !p.is_empty())
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RuleRecord {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub value: String,
    pub policy: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub no_resolve: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub comment: String,
}
