#![cfg(feature = "retrieve")]

use std::sync::Arc;

use mockito::Matcher;

use lib_marketfeed::cache::{CacheConfig, CacheError, CoalescingCache};
use lib_marketfeed::retrieve::{MarketData, MarketRestClient, RestConfig, RestError, SortOrder, Timespan};

fn market_data(server: &mockito::ServerGuard) -> MarketData {
    let client = MarketRestClient::new(&RestConfig {
        base_url: server.url(),
        api_key: "KEY".into(),
        timeout_ms: 2_000,
        max_retries: 0,
    })
    .unwrap();
    MarketData::new(Arc::new(client), CoalescingCache::new(CacheConfig::default()))
}

#[tokio::test]
async fn concurrent_previous_close_requests_hit_upstream_once() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v2/aggs/ticker/AAPL/prev")
        .match_query(Matcher::UrlEncoded("apiKey".into(), "KEY".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ticker":"AAPL","results":[{"c":189.25,"o":187.0,"h":190.0,"l":186.5,"v":1000}]}"#)
        .expect(1)
        .create_async()
        .await;

    let data = market_data(&server);
    let (a, b, c) = tokio::join!(
        data.previous_close("AAPL"),
        data.previous_close("AAPL"),
        data.previous_close("AAPL"),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
    assert_eq!(MarketData::close_price(&a), Some(189.25));

    // Served from cache afterwards.
    data.previous_close("AAPL").await.unwrap();
    assert!(data.cache().contains_key("prev-close:AAPL"));
    mock.assert_async().await;
}

#[tokio::test]
async fn upstream_errors_are_not_cached() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v1/marketstatus/now")
        .match_query(Matcher::Any)
        .with_status(403)
        .with_body(r#"{"status":"NOT_AUTHORIZED"}"#)
        .expect(2)
        .create_async()
        .await;

    let data = market_data(&server);
    for _ in 0..2 {
        let err = data.market_status().await.unwrap_err();
        let CacheError::FetchFailed { key, cause } = err;
        assert_eq!(key, "market-status");
        match cause.downcast_ref::<RestError>() {
            Some(RestError::Status { status, .. }) => assert_eq!(*status, 403),
            other => panic!("unexpected cause {other:?}"),
        }
    }
    assert!(!data.cache().contains_key("market-status"));
    mock.assert_async().await;
}

#[tokio::test]
async fn endpoints_build_expected_requests() {
    let mut server = mockito::Server::new_async().await;
    let search = server
        .mock("GET", "/v3/reference/tickers")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("search".into(), "apple".into()),
            Matcher::UrlEncoded("active".into(), "true".into()),
            Matcher::UrlEncoded("limit".into(), "20".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"results":[],"count":0}"#)
        .create_async()
        .await;
    let aggs = server
        .mock("GET", "/v2/aggs/ticker/MSFT/range/5/minute/2024-01-02/2024-01-03")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"ticker":"MSFT","results":[],"resultsCount":0}"#)
        .create_async()
        .await;
    let news = server
        .mock("GET", "/v2/reference/news")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("limit".into(), "10".into()),
            Matcher::UrlEncoded("order".into(), "desc".into()),
            Matcher::UrlEncoded("ticker".into(), "AAPL".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"results":[],"count":0}"#)
        .create_async()
        .await;

    let data = market_data(&server);
    data.search_tickers("apple").await.unwrap();
    data.aggregates("MSFT", 5, Timespan::Minute, "2024-01-02", "2024-01-03")
        .await
        .unwrap();
    data.news(Some("AAPL"), 10, SortOrder::Desc).await.unwrap();

    search.assert_async().await;
    aggs.assert_async().await;
    news.assert_async().await;
    assert!(data.cache().contains_key("news:AAPL:10:desc"));
    assert!(data.cache().contains_key("aggs:MSFT:5:minute:2024-01-02:2024-01-03"));
    assert!(data.cache().contains_key("tickers:apple"));
}
