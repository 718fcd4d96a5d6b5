//! Crawl a few pages through a rotating proxy pool.

use reqwest_middleware::ClientBuilder;
use rotating_proxy_pool::{PageRetryExceeded, ProxyOverride, ProxyPoolConfig, ProxyPoolMiddleware};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing proxy pool...");

    let config = ProxyPoolConfig::builder()
        // one proxy per line: `[scheme://]host:port [country] [anonymous|transparent]`
        .sources(vec![
            "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/http/data.txt",
        ])
        .filter_country(None)
        .refresh_interval(Duration::from_secs(600))
        .page_retry_budget(3)
        .direct_fallback_enabled(true)
        // rate limit for each proxy host, lower performance but avoid bans
        .max_requests_per_second(2.0)
        .request_timeout(Duration::from_secs(10))
        .build();

    let proxy_pool = ProxyPoolMiddleware::new(config).await?;
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(proxy_pool.clone())
        .build();

    for url in ["https://httpbin.org/ip", "https://httpbin.org/status/403"] {
        println!("Fetching {}...", url);
        match client.get(url).send().await {
            Ok(response) => {
                let gave_up = response.extensions().get::<PageRetryExceeded>().copied();
                println!("Status: {} (page failure: {:?})", response.status(), gave_up);
            }
            Err(e) => println!("Failed: {}", e),
        }
    }

    // Requests can opt out of the pool entirely.
    let response = client
        .get("https://httpbin.org/ip")
        .with_extension(ProxyOverride::no_proxy())
        .send()
        .await?;
    println!("Direct: {}", response.text().await?);

    let stats = proxy_pool.manager().stats();
    println!("Pool: {} alive, {} dead of {}", stats.alive, stats.dead, stats.total);

    proxy_pool.shutdown().await;
    Ok(())
}
