use std::net::IpAddr;

use anyhow::Result;

/// GeoIP 查询能力；规则在调用 `lookup_country` 前必须先检查 `is_initialized`
pub trait GeoIpLookup: Send + Sync {
    fn is_initialized(&self) -> bool;

    /// 查询 IP 对应的国家 ISO 代码（如 "CN", "US"）
    fn lookup_country(&self, ip: IpAddr) -> Result<String>;
}

/// GeoIP 数据库（MaxMind mmdb 格式）
pub struct GeoIpDb {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

impl GeoIpDb {
    /// 从 mmdb 文件加载
    pub fn load(path: &str) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path)
            .map_err(|e| anyhow::anyhow!("failed to load GeoIP database '{}': {}", path, e))?;
        Ok(Self {
            reader: Some(reader),
        })
    }

    /// 未加载数据库；所有 GEOIP 规则都不会命中
    pub fn uninitialized() -> Self {
        Self { reader: None }
    }
}

impl GeoIpLookup for GeoIpDb {
    fn is_initialized(&self) -> bool {
        self.reader.is_some()
    }

    fn lookup_country(&self, ip: IpAddr) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct Country {
            country: Option<CountryInfo>,
        }
        #[derive(serde::Deserialize)]
        struct CountryInfo {
            iso_code: Option<String>,
        }

        let reader = self
            .reader
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("GeoIP database not loaded"))?;
        let result: Country = reader
            .lookup(ip)
            .map_err(|e| anyhow::anyhow!("GeoIP lookup for {} failed: {}", ip, e))?;
        result
            .country
            .and_then(|c| c.iso_code)
            .ok_or_else(|| anyhow::anyhow!("no country for {}", ip))
    }
}
