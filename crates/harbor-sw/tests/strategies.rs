//! Request routing through an active worker.

mod common;

use std::time::Duration;

use common::{abs, script, url, Harness};
use harbor_cache::CacheKey;
use harbor_net::{Request, RequestMode};
use harbor_sw::{ResponseSource, WorkerScript};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

async fn activated(harness: &Harness, script: WorkerScript) -> harbor_sw::ClientId {
    harness.registration.update(script).await.unwrap();
    harness.registration.connect_client(url("/")).await.id
}

#[tokio::test]
async fn test_images_are_cache_first_until_expiry() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;
    harness.fetcher.respond(&abs("/img/logo.png"), 200, "png-bytes");

    let fetch = || Request::get(url("/img/logo.png"));
    let first = harness.registration.fetch(client, fetch()).await.unwrap();
    let second = harness.registration.fetch(client, fetch()).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body.as_ref(), b"png-bytes");
    assert_eq!(harness.fetcher.calls(&abs("/img/logo.png")), 1);

    harness.clock.advance(DAY * 29);
    harness.registration.fetch(client, fetch()).await.unwrap();
    assert_eq!(harness.fetcher.calls(&abs("/img/logo.png")), 1);

    harness.clock.advance(DAY * 2);
    let refetched = harness.registration.fetch(client, fetch()).await.unwrap();
    assert_eq!(refetched.source, ResponseSource::Network);
    assert_eq!(harness.fetcher.calls(&abs("/img/logo.png")), 2);
}

#[tokio::test]
async fn test_image_cache_keeps_newest_fifty() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;

    for i in 0..51 {
        let path = format!("/img/{i}.jpg");
        harness.fetcher.respond(&abs(&path), 200, "jpg");
        harness
            .registration
            .fetch(client, Request::get(url(&path)))
            .await
            .unwrap();
        harness.clock.advance(Duration::from_secs(1));
    }

    let images = harness.caches.open("images").await.unwrap();
    assert_eq!(images.len().await.unwrap(), 50);
    assert!(images
        .get(&CacheKey::get(&url("/img/0.jpg")))
        .await
        .unwrap()
        .is_none());
    assert!(images
        .get(&CacheKey::get(&url("/img/50.jpg")))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_stylesheets_are_served_stale_then_refreshed() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;
    let css = abs("/styles/main.css");
    harness.fetcher.respond(&css, 200, "body{color:red}");

    let first = harness
        .registration
        .fetch(client, Request::get(url("/styles/main.css")))
        .await
        .unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    harness.fetcher.respond(&css, 200, "body{color:blue}");
    let stale = harness
        .registration
        .fetch(client, Request::get(url("/styles/main.css")))
        .await
        .unwrap();
    assert_eq!(stale.source, ResponseSource::Cache);
    assert_eq!(stale.response.body.as_ref(), b"body{color:red}");

    stale
        .revalidation
        .expect("revalidation spawned on cache hit")
        .await
        .unwrap();
    assert_eq!(harness.fetcher.calls(&css), 2);

    let fresh = harness
        .registration
        .fetch(client, Request::get(url("/styles/main.css")))
        .await
        .unwrap();
    assert_eq!(fresh.response.body.as_ref(), b"body{color:blue}");
}

#[tokio::test]
async fn test_navigation_falls_back_to_offline_page() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;
    harness.fetcher.respond(&abs("/settings"), 200, "<html>settings</html>");

    let online = harness
        .registration
        .fetch(client, Request::navigate(url("/settings")))
        .await
        .unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    harness.fetcher.set_offline(true);
    let offline = harness
        .registration
        .fetch(client, Request::navigate(url("/settings")))
        .await
        .unwrap();
    assert_eq!(offline.source, ResponseSource::OfflineFallback);
    assert_eq!(offline.response.status, 200);
    assert_eq!(offline.response.body.as_ref(), b"<html>offline</html>");
}

#[tokio::test]
async fn test_offline_subresource_miss_is_an_error() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;
    harness.fetcher.set_offline(true);

    let result = harness
        .registration
        .fetch(client, Request::get(url("/img/never-seen.png")))
        .await;
    assert!(matches!(result, Err(harbor_sw::ServiceWorkerError::Network(_))));
}

#[tokio::test]
async fn test_app_shell_serves_every_navigation() {
    let harness = Harness::new();
    let mut shell = script("1", "a");
    shell.config.app_shell_url = Some("/index.html".to_string());
    let client = activated(&harness, shell).await;
    harness.fetcher.set_offline(true);

    let response = harness
        .registration
        .fetch(client, Request::navigate(url("/projects/42/board")))
        .await
        .unwrap();
    assert_eq!(response.source, ResponseSource::Precache);
    assert_eq!(response.response.body.as_ref(), b"<html>shell v1</html>");
}

#[tokio::test]
async fn test_precached_assets_skip_the_network() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;
    let installs = harness.fetcher.calls(&abs("/app.js"));

    let response = harness
        .registration
        .fetch(client, Request::get(url("/app.js?utm_source=newsletter")))
        .await
        .unwrap();
    assert_eq!(response.source, ResponseSource::Precache);
    assert_eq!(harness.fetcher.calls(&abs("/app.js")), installs);
}

#[tokio::test]
async fn test_opaque_webfonts_are_cached() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;
    let font = "https://fonts.gstatic.com/s/inter/v13/inter.woff2";
    harness.fetcher.respond(font, 0, "");

    let request = || Request::parse(font).unwrap().mode(RequestMode::NoCors);
    harness.registration.fetch(client, request()).await.unwrap();
    let second = harness.registration.fetch(client, request()).await.unwrap();

    assert_eq!(second.source, ResponseSource::Cache);
    assert!(second.response.is_opaque());
    assert_eq!(harness.fetcher.calls(font), 1);
}

#[tokio::test]
async fn test_api_requests_are_never_cached() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;
    harness.fetcher.respond(&abs("/api/me"), 200, "{}");

    for _ in 0..2 {
        let response = harness
            .registration
            .fetch(client, Request::get(url("/api/me")))
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::Network);
    }
    assert_eq!(harness.fetcher.calls(&abs("/api/me")), 2);
}

#[tokio::test]
async fn test_denylisted_navigation_still_gets_offline_page() {
    let harness = Harness::new();
    let mut shell = script("1", "a");
    shell.config.app_shell_url = Some("/index.html".to_string());
    let client = activated(&harness, shell).await;
    harness.fetcher.respond(&abs("/api/export"), 200, "csv");

    let online = harness
        .registration
        .fetch(client, Request::navigate(url("/api/export")))
        .await
        .unwrap();
    assert_eq!(online.source, ResponseSource::Network);
    assert_eq!(online.response.body.as_ref(), b"csv");

    harness.fetcher.set_offline(true);
    let offline = harness
        .registration
        .fetch(client, Request::navigate(url("/api/export")))
        .await
        .unwrap();
    assert_eq!(offline.source, ResponseSource::OfflineFallback);
    assert_eq!(offline.response.status, 200);
    assert_eq!(offline.response.body.as_ref(), b"<html>offline</html>");
}

#[tokio::test]
async fn test_font_stylesheets_are_served_stale_then_refreshed() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;
    let css = "https://fonts.googleapis.com/css2?family=Inter";
    harness.fetcher.respond(css, 200, "@font-face{v1}");

    let request = || Request::parse(css).unwrap().mode(RequestMode::Cors);
    let first = harness.registration.fetch(client, request()).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    harness.fetcher.respond(css, 200, "@font-face{v2}");
    let stale = harness.registration.fetch(client, request()).await.unwrap();
    assert_eq!(stale.source, ResponseSource::Cache);
    assert_eq!(stale.response.body.as_ref(), b"@font-face{v1}");
    stale.revalidation.unwrap().await.unwrap();

    let fresh = harness.registration.fetch(client, request()).await.unwrap();
    assert_eq!(fresh.response.body.as_ref(), b"@font-face{v2}");

    let stylesheets = harness.caches.open("google-fonts-stylesheets").await.unwrap();
    assert_eq!(stylesheets.len().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_for_one_key_share_a_single_entry() {
    let harness = Harness::new();
    let client = activated(&harness, script("1", "a")).await;
    let css = abs("/styles/theme.css");
    harness.fetcher.respond(&css, 200, "theme");

    let requests = (0..16).map(|_| {
        harness
            .registration
            .fetch(client, Request::get(url("/styles/theme.css")))
    });
    let responses = futures::future::join_all(requests).await;

    let mut revalidations = Vec::new();
    for response in responses {
        let response = response.unwrap();
        assert_eq!(response.response.body.as_ref(), b"theme");
        revalidations.extend(response.revalidation);
    }
    for handle in revalidations {
        handle.await.unwrap();
    }

    let statics = harness.caches.open("static-resources").await.unwrap();
    assert_eq!(statics.len().await.unwrap(), 1);
    let entry = statics
        .get(&CacheKey::get(&url("/styles/theme.css")))
        .await
        .unwrap()
        .expect("entry stored");
    assert_eq!(entry.body.as_ref(), b"theme");
}
