//! 策略路由核心：规则匹配引擎 + 代理组。
//!
//! 请求元数据经 [`router::RuleEngine`] 匹配出策略名，再由 [`app::Engine`]
//! 解析为出站（DIRECT / REJECT / 代理 / 代理组）并拨号。

pub mod app;
pub mod common;
pub mod config;
pub mod proxy;
pub mod router;
