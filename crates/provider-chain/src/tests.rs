//! Request budgets measured against a local HTTP server.

use crate::{AlphaVantageClient, ChainSettings, ProviderChain, RateLimiter};
use analysis_core::{ChainError, ProviderAdapter, ProviderOutcome};
use polygon_client::PolygonClient;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves canned provider JSON and counts every request that reaches it.
async fn fixture_server(hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut read = 0;
                while read < buf.len() {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head = String::from_utf8_lossy(&buf[..read]).to_string();
                let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                hits.fetch_add(1, Ordering::SeqCst);

                let body = fixture_body(&target).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

fn fixture_body(target: &str) -> serde_json::Value {
    if target.starts_with("/v3/reference/tickers/") {
        serde_json::json!({ "results": {
            "ticker": "KO", "name": "Coca-Cola Co", "primary_exchange": "XNYS",
            "weighted_shares_outstanding": 4_300_000_000.0
        }})
    } else if target.starts_with("/vX/reference/financials") {
        serde_json::json!({ "results": [{ "financials": {
            "income_statement": {
                "revenues": { "value": 45_000_000_000.0 },
                "net_income_loss": { "value": 10_700_000_000.0 },
                "basic_earnings_per_share": { "value": 2.47 }
            },
            "balance_sheet": { "equity": { "value": 26_000_000_000.0 } },
            "cash_flow_statement": {}
        }}]})
    } else if target.starts_with("/v2/snapshot/") {
        serde_json::json!({ "ticker": { "lastTrade": { "p": 62.4 } } })
    } else if target.contains("function=OVERVIEW") {
        serde_json::json!({
            "Symbol": "KO", "Name": "Coca-Cola Co", "RevenueTTM": "45000000000",
            "SharesOutstanding": "4300000000", "EPS": "2.47"
        })
    } else if target.contains("function=GLOBAL_QUOTE") {
        serde_json::json!({ "Global Quote": { "05. price": "62.40" } })
    } else {
        serde_json::json!({})
    }
}

fn single_provider_chain(
    adapter: Arc<dyn ProviderAdapter>,
    limiter: RateLimiter,
) -> ProviderChain {
    ProviderChain::new(vec![adapter], Arc::new(limiter), ChainSettings::default()).unwrap()
}

/// Runs `n` sequential fetches and returns how many succeeded.
async fn fetch_sequentially(chain: &ProviderChain, n: usize) -> usize {
    let mut succeeded = 0;
    for _ in 0..n {
        match chain.fetch("KO").await {
            Ok(_) => succeeded += 1,
            Err(ChainError::NoDataAvailable { attempts, .. }) => {
                assert!(attempts.iter().all(|a| a.outcome == ProviderOutcome::RateLimited));
            }
            Err(e) => panic!("unexpected chain error: {}", e),
        }
    }
    succeeded
}

#[tokio::test]
async fn test_polygon_budget_counts_every_http_request() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = fixture_server(Arc::clone(&hits)).await;
    let polygon = PolygonClient::new("test-key".into()).with_base_url(base);
    let limiter = RateLimiter::new(Duration::from_millis(50)).with_limit("polygon", 5);
    let chain = single_provider_chain(Arc::new(polygon), limiter);

    let succeeded = fetch_sequentially(&chain, 5).await;

    // details + financials + snapshot per fetch: one full fetch fits in five requests
    assert_eq!(succeeded, 1);
    assert!(
        hits.load(Ordering::SeqCst) <= 5,
        "{} requests reached polygon with a budget of 5",
        hits.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_alpha_vantage_budget_counts_every_http_request() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = fixture_server(Arc::clone(&hits)).await;
    let alpha =
        AlphaVantageClient::new("test-key".into()).with_base_url(format!("{}/query", base));
    let limiter = RateLimiter::new(Duration::from_millis(50)).with_limit("alpha_vantage", 5);
    let chain = single_provider_chain(Arc::new(alpha), limiter);

    let succeeded = fetch_sequentially(&chain, 5).await;

    // overview + quote per fetch
    assert_eq!(succeeded, 2);
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_unlimited_provider_is_not_gated() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = fixture_server(Arc::clone(&hits)).await;
    let polygon = PolygonClient::new("test-key".into()).with_base_url(base);
    let limiter = RateLimiter::new(Duration::from_millis(50));
    let chain = single_provider_chain(Arc::new(polygon), limiter);

    assert_eq!(fetch_sequentially(&chain, 2).await, 2);
    assert_eq!(hits.load(Ordering::SeqCst), 6);
}
