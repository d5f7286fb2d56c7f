//! 远程订阅源：拉取、过滤、热替换、缓存兜底

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use outway::app::outbound_manager::OutboundManager;
use outway::app::proxy_provider::{Provider, ProviderManager, RemoteProvider};
use outway::common::PauseManager;
use outway::config::types::ProviderConfig;
use outway::proxy::group::history::HistoryStorage;
use outway::proxy::outbound::default_registry;
use outway::proxy::OutboundHandler;

fn new_manager() -> Arc<OutboundManager> {
    OutboundManager::new(
        default_registry(),
        Arc::new(ProviderManager::new()),
        String::new(),
        None,
        Arc::new(HistoryStorage::new()),
        PauseManager::new(),
    )
}

/// 可热替换应答体的本地订阅服务
struct SubscriptionServer {
    addr: SocketAddr,
    body: Arc<Mutex<String>>,
    handle: tokio::task::JoinHandle<()>,
}

impl SubscriptionServer {
    async fn serve(initial: &str) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = Arc::new(Mutex::new(initial.to_string()));
        let served = body.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let payload = served.lock().unwrap().clone();
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 2048];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        payload.len(),
                        payload
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        Self { addr, body, handle }
    }

    fn set_body(&self, body: &str) {
        *self.body.lock().unwrap() = body.to_string();
    }

    fn url(&self) -> String {
        format!("http://{}/sub", self.addr)
    }
}

impl Drop for SubscriptionServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn remote_config(tag: &str, url: &str) -> ProviderConfig {
    ProviderConfig {
        tag: tag.to_string(),
        provider_type: "remote".to_string(),
        url: Some(url.to_string()),
        interval: None,
        include: None,
        exclude: None,
        cache_file: None,
        download_detour: None,
        outbounds: Vec::new(),
    }
}

fn provider_tags(outbounds: &[outway::proxy::ArcOutbound]) -> Vec<String> {
    outbounds.iter().map(|o| o.tag().to_string()).collect()
}

const BODY_V1: &str = "socks://u:p@10.0.0.1:1080#US-1\nsocks://u:p@10.0.0.2:1080#JP-1\nsocks://u:p@10.0.0.3:1080#US-2\n";
const BODY_V2: &str = "socks://u:p@10.0.0.1:1080#US-1\n";

#[tokio::test]
async fn include_filter_and_tag_prefixing() {
    let server = SubscriptionServer::serve(BODY_V1).await;
    let manager = new_manager();
    let mut config = remote_config("P", &server.url());
    config.include = Some("^US".to_string());
    let provider = Arc::new(RemoteProvider::new(Arc::downgrade(&manager), &config).unwrap());

    provider.update().await.unwrap();
    assert!(provider.is_ready());

    let tags = provider_tags(&provider.outbounds().await);
    assert_eq!(tags, vec!["P US-1", "P US-2"]);
    assert!(provider.outbound("P US-1").await.is_some());
    assert!(provider.outbound("P JP-1").await.is_none());
    assert!(provider.updated_at().await.is_some());
}

#[tokio::test]
async fn hot_reload_replaces_member_set() {
    let server = SubscriptionServer::serve(BODY_V1).await;
    let manager = new_manager();
    let mut config = remote_config("P", &server.url());
    config.include = Some("^US".to_string());
    let provider = Arc::new(RemoteProvider::new(Arc::downgrade(&manager), &config).unwrap());

    provider.update().await.unwrap();
    let first_updated = provider.updated_at().await.unwrap();
    assert_eq!(
        provider_tags(&provider.outbounds().await),
        vec!["P US-1", "P US-2"]
    );

    server.set_body(BODY_V2);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    provider.update().await.unwrap();

    assert_eq!(provider_tags(&provider.outbounds().await), vec!["P US-1"]);
    assert!(provider.outbound("P US-2").await.is_none());
    assert!(provider.updated_at().await.unwrap() > first_updated);
}

#[tokio::test]
async fn unchanged_body_preserves_member_identity() {
    let server = SubscriptionServer::serve(BODY_V2).await;
    let manager = new_manager();
    let config = remote_config("P", &server.url());
    let provider = Arc::new(RemoteProvider::new(Arc::downgrade(&manager), &config).unwrap());

    provider.update().await.unwrap();
    let before = provider.outbounds().await;
    let first_updated = provider.updated_at().await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    provider.update().await.unwrap();
    let after = provider.outbounds().await;

    // 哈希一致：不重建，成员对象原样保留，时间戳推进
    assert_eq!(before.len(), after.len());
    assert!(Arc::ptr_eq(&before[0], &after[0]));
    assert!(provider.updated_at().await.unwrap() > first_updated);
}

#[tokio::test]
async fn empty_body_keeps_previous_outbounds() {
    let server = SubscriptionServer::serve(BODY_V2).await;
    let manager = new_manager();
    let config = remote_config("P", &server.url());
    let provider = Arc::new(RemoteProvider::new(Arc::downgrade(&manager), &config).unwrap());

    provider.update().await.unwrap();
    assert_eq!(provider.outbounds().await.len(), 1);

    server.set_body("");
    assert!(provider.update().await.is_err());
    assert_eq!(provider.outbounds().await.len(), 1);
}

#[tokio::test]
async fn first_fetch_failure_loads_cache_file() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("sub.cache");
    std::fs::write(&cache_path, BODY_V1).unwrap();

    // 拿到端口立即释放，拉取必然失败
    let dead = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    let manager = new_manager();
    let mut config = remote_config("P", &format!("http://{}/sub", dead));
    config.cache_file = Some(cache_path.to_str().unwrap().to_string());
    let provider = Arc::new(RemoteProvider::new(Arc::downgrade(&manager), &config).unwrap());

    provider.update().await.unwrap();
    assert!(provider.is_ready());
    assert_eq!(
        provider_tags(&provider.outbounds().await),
        vec!["P US-1", "P JP-1", "P US-2"]
    );
    // 缓存文件 mtime 充当 updatedAt
    assert!(provider.updated_at().await.is_some());
}

#[tokio::test]
async fn fetch_failure_without_cache_errors_but_becomes_ready() {
    let dead = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    let manager = new_manager();
    let config = remote_config("P", &format!("http://{}/sub", dead));
    let provider = Arc::new(RemoteProvider::new(Arc::downgrade(&manager), &config).unwrap());

    assert!(provider.update().await.is_err());
    // 首次尝试后就绪，等待方不再被卡住
    assert!(provider.is_ready());
    assert!(provider.outbounds().await.is_empty());
}

#[tokio::test]
async fn shadowrocket_status_line_surfaces_as_info() {
    let body = format!(
        "STATUS=🚀↑:0.53GB,↓:14.07GB,TOT:160GB💡Expires:2023-12-05\n{}",
        BODY_V2
    );
    let server = SubscriptionServer::serve(&body).await;
    let manager = new_manager();
    let config = remote_config("P", &server.url());
    let provider = Arc::new(RemoteProvider::new(Arc::downgrade(&manager), &config).unwrap());

    provider.update().await.unwrap();
    let info = provider.info().await.unwrap();
    assert_eq!(info.total, 160 * 1024 * 1024 * 1024);
    assert!(info.expire > 0);
    assert_eq!(provider.outbounds().await.len(), 1);
}

#[tokio::test]
async fn non_200_status_is_rejected() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        // 不跟随重定向：首个响应必须是 200
        let _ = stream
            .write_all(b"HTTP/1.1 302 Found\r\nLocation: http://example.com/\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await;
    });

    let manager = new_manager();
    let config = remote_config("P", &format!("http://{}/sub", addr));
    let provider = Arc::new(RemoteProvider::new(Arc::downgrade(&manager), &config).unwrap());

    let err = provider.update().await.unwrap_err();
    assert!(format!("{:#}", err).contains("302"), "got: {:#}", err);

    server.await.unwrap();
}
