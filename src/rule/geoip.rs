use std::net::IpAddr;

use anyhow::Result;
use maxminddb::geoip2;

/// GeoIP 国家库（MaxMind mmdb 格式）
pub struct GeoIpDb {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl GeoIpDb {
    pub fn load(path: &str) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path)
            .map_err(|e| anyhow::anyhow!("failed to load GeoIP database '{}': {}", path, e))?;
        Ok(Self { reader })
    }

    /// 查询 IP 对应的国家 ISO 代码（如 "CN"、"US"）
    pub fn lookup_country(&self, ip: IpAddr) -> Option<String> {
        let country: geoip2::Country = self.reader.lookup(ip).ok()?;
        country
            .country
            .and_then(|c| c.iso_code)
            .map(str::to_string)
    }
}
