pub mod geoip;
pub mod metadata;
pub mod parser;
pub mod provider;
pub mod rules;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::config::types::RuleEntry;
use geoip::GeoIpLookup;
use metadata::RequestMetadata;
use parser::RuleParser;
use provider::RuleSet;
use rules::{Rule, RuleKind, RuleSnapshot};

/// 有序规则表，首个命中的启用规则胜出
///
/// 整个 `match_request` 持有同一个读锁，并发匹配互不阻塞；
/// 重新加载时整表替换。
pub struct RuleEngine {
    parser: RuleParser,
    rules: RwLock<Vec<Arc<Rule>>>,
}

impl RuleEngine {
    pub fn new(geoip: Arc<dyn GeoIpLookup>) -> Self {
        Self {
            parser: RuleParser::new(geoip),
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.parser = self.parser.with_fetch_timeout(timeout);
        self
    }

    pub fn parser(&self) -> &RuleParser {
        &self.parser
    }

    /// 解析全部条目后整表替换；任一条目无效则整批拒绝，旧表保持不变
    pub fn load_from_config(&self, entries: &[RuleEntry]) -> Result<usize> {
        let mut parsed = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let rule = match entry {
                RuleEntry::Line(line) => self.parser.parse_line(line),
                RuleEntry::Record(record) => self.parser.parse_record(record).map(Some),
            }
            .map_err(|e| e.context(format!("rule #{}", i)))?;
            if let Some(rule) = rule {
                parsed.push(Arc::new(rule));
            }
        }

        let count = parsed.len();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = parsed;
        info!(rules = count, "rules loaded");
        Ok(count)
    }

    /// 追加一条规则（优先级最低）
    pub fn push(&self, rule: Rule) {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(rule));
    }

    /// 按顺序匹配；命中规则的计数加一。无命中返回 `None`，不是错误
    pub fn match_request(&self, meta: &RequestMetadata) -> Option<Arc<Rule>> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        for rule in rules.iter() {
            if !rule.is_enabled() || !rule.matches(meta) {
                continue;
            }
            rule.record_hit();
            debug!(
                host = %meta.host,
                port = meta.port,
                rule = rule.rule_type(),
                payload = rule.payload(),
                policy = rule.policy(),
                "rule matched"
            );
            return Some(rule.clone());
        }
        None
    }

    pub fn toggle_rule(&self, index: usize, enabled: bool) -> Result<()> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let rule = rules.get(index).ok_or_else(|| {
            anyhow::anyhow!("rule index {} out of range ({} rules)", index, rules.len())
        })?;
        rule.set_enabled(enabled);
        info!(index, enabled, rule = %rule, "rule toggled");
        Ok(())
    }

    pub fn reset_counters(&self) {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        for rule in rules.iter() {
            rule.reset_hits();
        }
    }

    /// 当前规则状态的快照
    pub fn rules(&self) -> Vec<RuleSnapshot> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules
            .iter()
            .enumerate()
            .map(|(i, r)| r.snapshot(i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 表中所有顶层 RULE-SET 规则引用的规则集
    pub fn rule_sets(&self) -> Vec<Arc<RuleSet>> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules
            .iter()
            .filter_map(|r| match r.kind() {
                RuleKind::RuleSet(set) => Some(set.clone()),
                _ => None,
            })
            .collect()
    }

    /// 规则引用的全部策略名（去重，保持首次出现顺序）
    pub fn policies(&self) -> Vec<String> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = Vec::new();
        for rule in rules.iter() {
            if !out.iter().any(|p| p == rule.policy()) {
                out.push(rule.policy().to_string());
            }
        }
        out
    }
}
