//! Resolver behaviour against a local HTTP server

use newscard::{ProxyConfig, Resolution, ResolverConfig, ResourceRole, Resolver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiny_http::{Header, Response, Server};

// 1x1 transparent PNG
const PIXEL: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

#[derive(Default)]
struct Seen {
    hits: AtomicUsize,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

/// Serves `/pixel.png`, `/photo` (png without extension), `/page` (HTML) and
/// `/proxy` (bytes only with the right bearer token); anything else is 404.
fn start_server(port: u16) -> (String, Arc<Seen>) {
    let seen = Arc::new(Seen::default());
    let server = Server::http(("127.0.0.1", port)).unwrap();
    let counter = seen.clone();
    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            counter.hits.fetch_add(1, Ordering::SeqCst);
            let auth = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Authorization"))
                .map(|h| h.value.as_str().to_string());
            let url = request.url().to_string();
            counter.requests.lock().unwrap().push((url.clone(), auth.clone()));

            let png = "Content-Type: image/png".parse::<Header>().unwrap();
            let path = url.split('?').next().unwrap_or_default().to_string();
            let response = match path.as_str() {
                "/pixel.png" | "/photo" => Response::from_data(PIXEL.to_vec()).with_header(png),
                "/page" => Response::from_data(b"<html><body>preview</body></html>".to_vec())
                    .with_header("Content-Type: text/html; charset=utf-8".parse::<Header>().unwrap()),
                "/proxy" if auth.as_deref() == Some("Bearer s3cret") && url.contains("direct=1") => {
                    Response::from_data(PIXEL.to_vec()).with_header(png)
                }
                "/proxy" => Response::from_data(b"denied".to_vec()).with_status_code(403),
                _ => Response::from_data(b"Not Found".to_vec()).with_status_code(404),
            };
            let _ = request.respond(response);
        }
    });
    std::thread::sleep(Duration::from_millis(100));
    (format!("http://127.0.0.1:{}", port), seen)
}

fn resolver(dir: &std::path::Path, proxy: Option<ProxyConfig>) -> Resolver {
    Resolver::new(ResolverConfig {
        cache_dir: dir.to_path_buf(),
        proxy,
        fetch_timeout: Duration::from_secs(3),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn same_url_is_fetched_once() {
    let (base, seen) = start_server(18181);
    let dir = tempfile::tempdir().unwrap();
    let resolver = resolver(dir.path(), None);
    let url = format!("{}/pixel.png", base);

    let first = resolver.resolve("job-a", Some(&url), ResourceRole::News).await;
    let second = resolver.resolve("job-b", Some(&url), ResourceRole::News).await;

    match (&first, &second) {
        (
            Resolution::Local { path: p1, cache_hit: false, .. },
            Resolution::Local { path: p2, cache_hit: true, .. },
        ) => {
            assert_eq!(p1, p2);
            assert_eq!(std::fs::read(p1).unwrap(), PIXEL);
            let name = p1.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("job-a-news-"), "{}", name);
            assert!(name.ends_with(".png"), "{}", name);
        }
        other => panic!("unexpected resolutions {:?}", other),
    }
    assert_eq!(seen.hits.load(Ordering::SeqCst), 1);
    assert!(first.href().unwrap().starts_with("file://"));
}

#[tokio::test]
async fn cache_survives_a_new_resolver() {
    let (base, seen) = start_server(18182);
    let dir = tempfile::tempdir().unwrap();
    let url = format!("{}/pixel.png", base);

    let first = resolver(dir.path(), None)
        .resolve("job-a", Some(&url), ResourceRole::Background)
        .await;
    assert!(matches!(first, Resolution::Local { cache_hit: false, .. }));

    // A fresh process only has the directory to go on
    let again = resolver(dir.path(), None)
        .resolve("job-b", Some(&url), ResourceRole::Background)
        .await;
    assert!(matches!(again, Resolution::Local { cache_hit: true, .. }));
    assert_eq!(seen.hits.load(Ordering::SeqCst), 1);

    // Roles are cached separately
    let other_role = resolver(dir.path(), None)
        .resolve("job-b", Some(&url), ResourceRole::News)
        .await;
    assert!(matches!(other_role, Resolution::Local { cache_hit: false, .. }));
}

#[tokio::test]
async fn failures_degrade_to_the_original_reference() {
    let (base, _seen) = start_server(18183);
    let dir = tempfile::tempdir().unwrap();
    let resolver = resolver(dir.path(), None);

    let missing = format!("{}/nope.jpg", base);
    let res = resolver.resolve("job", Some(&missing), ResourceRole::News).await;
    assert!(res.is_degraded());
    assert_eq!(res.href(), Some(missing.as_str()));

    let page = format!("{}/page", base);
    let res = resolver.resolve("job", Some(&page), ResourceRole::Background).await;
    assert!(res.is_degraded(), "HTML must not be cached as an image");

    // Nothing half-written is left behind
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn extension_follows_content_type_when_path_has_none() {
    let (base, _seen) = start_server(18184);
    let dir = tempfile::tempdir().unwrap();
    let resolver = resolver(dir.path(), None);

    let res = resolver
        .resolve("job", Some(&format!("{}/photo", base)), ResourceRole::Background)
        .await;
    match res {
        Resolution::Local { path, .. } => {
            assert_eq!(path.extension().and_then(|e| e.to_str()), Some("png"));
        }
        other => panic!("expected local file, got {:?}", other),
    }
}

#[tokio::test]
async fn drive_links_go_through_the_proxy() {
    let (base, seen) = start_server(18185);
    let dir = tempfile::tempdir().unwrap();
    let resolver = resolver(
        dir.path(),
        Some(ProxyConfig {
            url: format!("{}/proxy", base),
            token: Some("s3cret".into()),
        }),
    );

    let share = "https://drive.google.com/file/d/AbC123xyz/view?usp=sharing";
    let res = resolver.resolve("job", Some(share), ResourceRole::News).await;
    assert!(matches!(res, Resolution::Local { cache_hit: false, .. }), "{:?}", res);

    let requests = seen.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let (url, auth) = &requests[0];
    assert!(url.starts_with("/proxy?"), "{}", url);
    assert!(url.contains("id=AbC123xyz"), "{}", url);
    assert!(url.contains("direct=1"), "{}", url);
    assert_eq!(auth.as_deref(), Some("Bearer s3cret"));

    // The file id is the cache key, so any share-link form of it hits
    let again = resolver
        .resolve(
            "job-2",
            Some("https://drive.google.com/open?id=AbC123xyz"),
            ResourceRole::News,
        )
        .await;
    assert!(matches!(again, Resolution::Local { cache_hit: true, .. }));
    assert_eq!(seen.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proxy_rejection_falls_back_to_a_direct_fetch() {
    let (base, seen) = start_server(18186);
    let dir = tempfile::tempdir().unwrap();
    // Treat the local server as the interstitial host so nothing leaves loopback
    let resolver = Resolver::new(ResolverConfig {
        cache_dir: dir.path().to_path_buf(),
        proxy: Some(ProxyConfig {
            url: format!("{}/proxy", base),
            token: Some("wrong".into()),
        }),
        proxy_hosts: vec!["127.0.0.1".into()],
        fetch_timeout: Duration::from_secs(3),
        ..Default::default()
    })
    .unwrap();

    let link = format!("{}/pixel.png?id=Zz9", base);
    let res = resolver.resolve("job", Some(&link), ResourceRole::Background).await;
    assert!(matches!(res, Resolution::Local { cache_hit: false, .. }), "{:?}", res);
    {
        let requests = seen.requests.lock().unwrap();
        let paths: Vec<&str> = requests.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(paths.len(), 2, "{:?}", paths);
        assert!(paths[0].starts_with("/proxy?"), "{:?}", paths);
        assert!(paths[0].contains("id=Zz9"), "{:?}", paths);
        assert_eq!(paths[1], "/pixel.png?id=Zz9");
    }

    // When the direct fetch fails too, the link is handed on unchanged
    let missing = format!("{}/nope.jpg?id=Yy8", base);
    let res = resolver.resolve("job", Some(&missing), ResourceRole::News).await;
    assert!(res.is_degraded(), "{:?}", res);
    assert_eq!(res.href(), Some(missing.as_str()));
    assert_eq!(seen.hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn hosts_outside_the_proxy_list_skip_the_proxy() {
    let (base, seen) = start_server(18187);
    let dir = tempfile::tempdir().unwrap();
    let resolver = resolver(
        dir.path(),
        Some(ProxyConfig {
            url: format!("{}/proxy", base),
            token: Some("s3cret".into()),
        }),
    );

    let link = format!("{}/pixel.png?id=Zz9", base);
    let res = resolver.resolve("job", Some(&link), ResourceRole::News).await;
    assert!(matches!(res, Resolution::Local { .. }), "{:?}", res);
    let requests = seen.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "/pixel.png?id=Zz9");
}
