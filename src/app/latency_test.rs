//! 单发延迟探测
//!
//! 经指定出站向目标 URL 发一次 GET，量到首个响应字节的耗时。不重试；
//! 超时与取消由调用方控制。健康检查和管理面的手动测速都走这里。

use std::time::Duration;

use anyhow::Result;

use crate::common::http;
use crate::proxy::{DialOptions, OutboundHandler};

/// 首字节延迟，毫秒，钳到 u16；0ms 的本地回环也至少记 1
pub async fn url_test(
    outbound: &dyn OutboundHandler,
    url: &str,
    opts: &DialOptions,
) -> Result<u16> {
    let elapsed = http::first_byte(outbound, url, opts).await?;
    let millis = elapsed.as_millis().min(u128::from(u16::MAX)) as u16;
    Ok(millis.max(1))
}

/// 带超时的便捷封装
pub async fn url_test_with_timeout(
    outbound: &dyn OutboundHandler,
    url: &str,
    timeout: Duration,
) -> Result<u16> {
    tokio::time::timeout(timeout, url_test(outbound, url, &DialOptions::default()))
        .await
        .map_err(|_| anyhow::anyhow!("url test timeout after {:?}", timeout))?
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use super::*;
    use crate::proxy::outbound::direct::DirectOutbound;
    use crate::proxy::outbound::{transport_dialer, BuildContext};

    fn direct() -> DirectOutbound {
        let ctx = BuildContext {
            manager: Weak::new(),
            cache: None,
            history: Arc::new(crate::proxy::group::history::HistoryStorage::new()),
            pause: crate::common::PauseManager::new(),
            detour_override: None,
        };
        DirectOutbound::with_dialer("direct".to_string(), transport_dialer(&ctx, &Default::default()))
    }

    async fn serve_204_once() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await;
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn measures_local_server() {
        let (addr, server) = serve_204_once().await;
        let outbound = direct();
        let url = format!("http://{}/generate_204", addr);
        let rtt = url_test(&outbound, &url, &DialOptions::default())
            .await
            .unwrap();
        assert!(rtt >= 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_target_errors() {
        let dead = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let outbound = direct();
        let url = format!("http://{}/x", dead);
        assert!(url_test(&outbound, &url, &DialOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn timeout_wrapper_fires() {
        // 黑洞地址（TEST-NET-1），连接会挂起直到超时
        let outbound = direct();
        let result = url_test_with_timeout(
            &outbound,
            "http://192.0.2.1:80/x",
            Duration::from_millis(50),
        )
        .await;
        assert!(result.is_err());
    }
}
