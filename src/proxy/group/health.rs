use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::common::{Address, RouterError};
use crate::proxy::{Network, OutboundHandler};

/// 默认测速地址
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";
/// 单次测速默认超时
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// 通过出站访问 `url`，测量到首个响应字节的耗时（毫秒）
///
/// 只发送明文 HTTP 请求，`https://` 地址直接报 Unsupported。
pub async fn probe_url(proxy: &dyn OutboundHandler, url: &str, timeout: Duration) -> Result<u64> {
    if url.get(..8).is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://")) {
        return Err(RouterError::Unsupported(format!("latency test over TLS: {}", url)).into());
    }
    let (host, port, path) = parse_url(url);
    let target = Address::new(&host, port);
    let start = Instant::now();

    let probe = async {
        let mut stream = proxy.dial(Network::Tcp, &target).await?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        stream.write_all(request.as_bytes()).await?;

        // 读取响应的第一部分就够了
        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed before response");
        }
        Ok::<_, anyhow::Error>(())
    };

    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(())) => Ok(start.elapsed().as_millis() as u64),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RouterError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("latency test via '{}' timed out", proxy.name()),
        ))
        .into()),
    }
}

/// 并发测试一组已解析的成员，全部完成后返回
///
/// 解析失败的成员（`None`）直接记为 not found。
pub async fn test_members(
    members: Vec<(String, Option<Arc<dyn OutboundHandler>>)>,
    url: &str,
    timeout: Duration,
) -> Vec<(String, Result<u64>)> {
    let tests = members.into_iter().map(|(name, handler)| async move {
        let result = match handler {
            Some(h) => h.test(url, timeout).await,
            None => Err(RouterError::NotFound(name.clone()).into()),
        };
        match &result {
            Ok(latency) => debug!(proxy = name, latency = latency, "health check result"),
            Err(e) => debug!(proxy = name, error = %e, "health check failed"),
        }
        (name, result)
    });
    join_all(tests).await
}

/// 解析简单 URL 为 (host, port, path)
pub fn parse_url(url: &str) -> (String, u16, String) {
    let (scheme, rest) = if let Some(r) = url.strip_prefix("https://") {
        ("https", r)
    } else if let Some(r) = url.strip_prefix("http://") {
        ("http", r)
    } else {
        ("http", url)
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let default_port: u16 = if scheme == "https" { 443 } else { 80 };

    let (host, port) = match host_port.rfind(':') {
        Some(idx) if !host_port.ends_with(']') => match host_port[idx + 1..].parse::<u16>() {
            Ok(p) => (&host_port[..idx], p),
            Err(_) => (host_port, default_port),
        },
        _ => (host_port, default_port),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host.to_string(), port, path.to_string())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::proxy::outbound::{DirectOutbound, RejectOutbound};

    #[test]
    fn parse_url_http() {
        let (host, port, path) = parse_url("http://www.gstatic.com/generate_204");
        assert_eq!(host, "www.gstatic.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/generate_204");
    }

    #[test]
    fn parse_url_https() {
        let (host, port, path) = parse_url("https://example.com/test");
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
        assert_eq!(path, "/test");
    }

    #[test]
    fn parse_url_with_port_and_v6() {
        let (host, port, path) = parse_url("http://localhost:8080/health");
        assert_eq!((host.as_str(), port, path.as_str()), ("localhost", 8080, "/health"));

        let (host, port, _) = parse_url("http://[::1]:8080/");
        assert_eq!((host.as_str(), port), ("::1", 8080));

        let (host, port, path) = parse_url("http://example.com");
        assert_eq!((host.as_str(), port, path.as_str()), ("example.com", 80, "/"));
    }

    #[tokio::test]
    async fn latency_test_rejects_https_urls() {
        let direct = DirectOutbound::new("DIRECT");
        for url in ["https://www.gstatic.com/generate_204", "HTTPS://example.com/"] {
            let err = probe_url(&direct, url, Duration::from_secs(1)).await.unwrap_err();
            assert_eq!(
                RouterError::classify(&err),
                crate::common::RouterErrorKind::Unsupported
            );
        }
    }

    #[tokio::test]
    async fn probe_measures_first_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = s.read(&mut buf).await.unwrap();
            s.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        });

        let direct = DirectOutbound::new("DIRECT");
        let url = format!("http://{}/generate_204", addr);
        let latency = probe_url(&direct, &url, Duration::from_secs(2)).await.unwrap();
        assert!(latency < 2000);
    }

    #[tokio::test]
    async fn probe_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let direct = DirectOutbound::new("DIRECT");
        let url = format!("http://{}/", addr);
        let err = probe_url(&direct, &url, Duration::from_millis(200)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_members_reports_every_member() {
        let reject: Arc<dyn OutboundHandler> = Arc::new(RejectOutbound::new("REJECT"));
        let results = test_members(
            vec![("REJECT".into(), Some(reject)), ("ghost".into(), None)],
            "http://127.0.0.1:9/",
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_err()));
        let ghost = &results.iter().find(|(n, _)| n == "ghost").unwrap().1;
        assert!(ghost.as_ref().unwrap_err().to_string().contains("not found"));
    }
}
