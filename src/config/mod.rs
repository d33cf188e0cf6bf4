pub mod subscription;
pub mod types;

use std::path::Path;

use anyhow::{Context, Result};

pub use types::Config;

use crate::common::RouterError;

/// 读取并校验 YAML 配置文件
pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config '{}'", path))?;
    parse_config(&content)
}

/// 从 YAML 文本解析配置
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(content)
        .map_err(|e| RouterError::Config(format!("invalid YAML: {}", e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RouterErrorKind;

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "log:\n  level: debug\nproxies:\n  - { name: s5, type: socks5, server: 127.0.0.1, port: 1080 }\nrules:\n  - FINAL,s5\n",
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.proxies[0].port, 1080);
    }

    #[test]
    fn syntax_errors_are_config_errors() {
        let err = parse_config("proxies: [").err().unwrap();
        assert_eq!(RouterError::classify(&err), RouterErrorKind::Config);
        assert!(load_config("/nonexistent/config.yaml").is_err());
    }
}
