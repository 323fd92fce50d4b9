//! Integration tests for the change-notification transports and the dev server

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::{Json, Router};
use common::{eventually, write_manifest, write_marker};
use hotswap::config::{ServerOptions, TransportConfig};
use hotswap::server::DevServer;
use hotswap::transport::{self, FetchTransport, FsTransport, Transport, WsTransport};
use hotswap::LockCoordinator;
use serde_json::json;
use tempfile::tempdir;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use url::Url;

const LIMIT: Duration = Duration::from_secs(5);

fn fast_config() -> TransportConfig {
    TransportConfig {
        retry_delay: Duration::from_millis(50),
        ..TransportConfig::default()
    }
}

/// Dev server over `root` on an ephemeral port; returns its base URL
async fn dev_server(root: &Path, lock: Arc<LockCoordinator>) -> (Url, CancellationToken) {
    let options = ServerOptions {
        host: "127.0.0.1".to_string(),
        port: 0,
        root: root.to_path_buf(),
        ..ServerOptions::default()
    };
    let server = DevServer::bind(options, lock).await.unwrap();
    let url = Url::parse(&server.url().unwrap()).unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));
    (url, cancel)
}

mod fs {
    use super::*;

    #[tokio::test]
    async fn test_manifest_round_trip() {
        let dir = tempdir().unwrap();
        let assets = dir.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        let manifest = assets.join("main.json");
        write_manifest(&manifest, &["a.js", "b.js"]);
        write_marker(&assets, "1");

        let (graph, loader) = common::graph();
        let lock = Arc::new(LockCoordinator::new().unwrap());
        let fs = FsTransport::new(graph, lock.clone()).unwrap();

        let url = Url::from_file_path(&manifest).unwrap();
        assert!(fs.start(&url));
        assert!(fs.start(&url));
        assert!(fs.is_watching(&manifest));

        assert!(eventually(LIMIT, || loader.count() == 2).await);
        let expected = vec![
            Url::from_file_path(assets.join("a.js")).unwrap().to_string(),
            Url::from_file_path(assets.join("b.js")).unwrap().to_string(),
        ];
        assert_eq!(loader.loaded(), expected);

        // no redelivery without a new generation
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(loader.count(), 2);

        write_manifest(&manifest, &["c.js"]);
        write_marker(&assets, "2");
        assert!(eventually(LIMIT, || loader.count() == 3).await);

        fs.shutdown();
        assert!(!fs.start(&url));
        lock.close();
    }

    #[tokio::test]
    async fn test_other_schemes_are_declined() {
        let (graph, _) = common::graph();
        let lock = Arc::new(LockCoordinator::new().unwrap());
        let fs = FsTransport::new(graph, lock).unwrap();
        assert!(!fs.start(&Url::parse("http://h/assets/main.json").unwrap()));
    }
}

mod observe {
    use super::*;

    #[tokio::test]
    async fn test_freeze_with_tracked_urls_keeps_transport_alive() {
        let (graph, _) = common::graph();
        let fetch: Arc<dyn Transport> =
            Arc::new(FetchTransport::new(graph.clone(), fast_config()).unwrap());
        assert!(transport::connect(&fetch, &graph));
        assert!(!transport::connect(&fetch, &graph));

        graph.track(&Url::parse("http://127.0.0.1:1/assets/entry-main.1.mjs").unwrap(), None);
        graph.freeze();
        graph.tasks().run_pending();
        assert!(!fetch.is_shut_down());
        fetch.shutdown();
    }

    #[tokio::test]
    async fn test_freeze_of_empty_set_shuts_transports_down() {
        let (graph, _) = common::graph();
        let ws: Arc<dyn Transport> = Arc::new(WsTransport::new(graph.clone(), fast_config()).unwrap());
        transport::connect(&ws, &graph);

        graph.tasks().run_pending();
        assert!(!ws.is_shut_down());

        graph.freeze();
        graph.tasks().run_pending();
        assert!(ws.is_shut_down());
        assert!(!ws.start(&Url::parse("http://h/assets/main.json").unwrap()));
    }

    #[tokio::test]
    async fn test_freeze_without_matching_scheme_shuts_transport_down() {
        let dir = tempdir().unwrap();
        let (graph, _) = common::graph();
        let lock = Arc::new(LockCoordinator::new().unwrap());
        let fs: Arc<dyn Transport> = Arc::new(FsTransport::new(graph.clone(), lock.clone()).unwrap());
        let fetch: Arc<dyn Transport> =
            Arc::new(FetchTransport::new(graph.clone(), fast_config()).unwrap());
        transport::connect(&fs, &graph);
        transport::connect(&fetch, &graph);

        let asset = Url::from_file_path(dir.path().join("assets/entry-main.1.mjs")).unwrap();
        graph.track(&asset, None);
        graph.tasks().run_pending();

        // still open: an http url may be tracked later
        assert!(!fetch.is_shut_down());

        graph.freeze();
        graph.tasks().run_pending();
        assert!(fetch.is_shut_down());
        assert!(!fs.is_shut_down());

        fs.shutdown();
        lock.close();
    }
}

mod fetch {
    use super::*;

    #[tokio::test]
    async fn test_non_success_ends_the_poll_loop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::NOT_FOUND
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (graph, loader) = common::graph();
        let fetch = FetchTransport::new(graph, fast_config()).unwrap();
        let url = Url::parse(&format!("http://{}/assets/main.json", addr)).unwrap();

        assert!(fetch.start(&url));
        assert!(eventually(LIMIT, || hits.load(Ordering::SeqCst) == 1).await);
        assert!(eventually(LIMIT, || !fetch.is_polling(&url)).await);

        // well past the retry delay: nothing else was scheduled
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(loader.count(), 0);

        // a fresh start polls again
        assert!(fetch.start(&url));
        assert!(eventually(LIMIT, || hits.load(Ordering::SeqCst) == 2).await);
        fetch.shutdown();
    }

    #[tokio::test]
    async fn test_long_poll_against_dev_server() {
        let root = tempdir().unwrap();
        let assets = root.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        write_manifest(&assets.join("main.json"), &["entry-main.1.mjs"]);
        write_marker(&assets, "1");

        let lock = Arc::new(LockCoordinator::new().unwrap());
        let (base, cancel) = dev_server(root.path(), lock.clone()).await;

        let (graph, loader) = common::graph();
        let fetch = FetchTransport::new(graph, fast_config()).unwrap();
        let manifest = base.join("assets/main.json").unwrap();
        assert!(fetch.start(&manifest));

        assert!(eventually(LIMIT, || loader.count() == 1).await);
        assert_eq!(
            loader.loaded()[0],
            base.join("assets/entry-main.1.mjs").unwrap().to_string()
        );

        write_manifest(&assets.join("main.json"), &["entry-main.2.mjs"]);
        write_marker(&assets, "2");
        assert!(eventually(LIMIT, || loader.count() == 2).await);
        assert!(loader.loaded()[1].ends_with("entry-main.2.mjs"));

        fetch.shutdown();
        cancel.cancel();
        lock.close();
    }

    #[tokio::test]
    async fn test_network_failure_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Json(json!({"chunks": ["a.mjs"]}))
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // the first connection is cut before any response
            if let Ok((first, _)) = listener.accept().await {
                drop(first);
            }
            axum::serve(listener, app).await
        });

        let (graph, loader) = common::graph();
        let config = TransportConfig {
            retry_delay: Duration::from_millis(200),
            ..TransportConfig::default()
        };
        let fetch = FetchTransport::new(graph, config).unwrap();
        let url = Url::parse(&format!("http://{}/assets/main.json", addr)).unwrap();

        let started = tokio::time::Instant::now();
        assert!(fetch.start(&url));
        assert!(eventually(LIMIT, || loader.count() == 1).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            loader.loaded(),
            vec![format!("http://{}/assets/a.mjs", addr)]
        );
        fetch.shutdown();
    }
}

mod ws {
    use super::*;

    #[tokio::test]
    async fn test_second_start_reuses_the_connection() {
        let (graph, _) = common::graph();
        let config = TransportConfig {
            retry_delay: Duration::from_secs(60),
            ..TransportConfig::default()
        };
        let ws = WsTransport::new(graph, config).unwrap();

        // nothing listens on port 1: the attempt fails and waits out the retry
        let url = Url::parse("http://127.0.0.1:1/assets/main.json").unwrap();
        assert!(ws.start(&url));
        assert!(ws.start(&url));

        assert!(eventually(LIMIT, || ws.connection_attempts() == 1).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ws.connection_attempts(), 1);
        ws.shutdown();
    }

    #[tokio::test]
    async fn test_silent_peer_is_dropped_and_redialed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // accept, agree on the subprotocol, then never read: pings go unanswered
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                let negotiate = |_: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                    response
                        .headers_mut()
                        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("hmr"));
                    Ok(response)
                };
                if let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, negotiate).await {
                    held.push(socket);
                }
            }
        });

        let (graph, loader) = common::graph();
        let config = TransportConfig {
            retry_delay: Duration::from_millis(50),
            keepalive_interval: Duration::from_millis(100),
            ..TransportConfig::default()
        };
        let ws = WsTransport::new(graph, config).unwrap();
        let url = Url::parse(&format!("http://{}/assets/main.json", addr)).unwrap();
        assert!(ws.start(&url));

        assert!(eventually(LIMIT, || ws.connection_attempts() >= 2).await);
        assert_eq!(loader.count(), 0);
        ws.shutdown();
    }

    #[tokio::test]
    async fn test_push_from_dev_server() {
        let root = tempdir().unwrap();
        let assets = root.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        write_manifest(&assets.join("main.json"), &["entry-main.1.mjs", "app-button.1.mjs"]);
        write_marker(&assets, "1");

        let lock = Arc::new(LockCoordinator::new().unwrap());
        let (base, cancel) = dev_server(root.path(), lock.clone()).await;

        let (graph, loader) = common::graph();
        let ws = WsTransport::new(graph, fast_config()).unwrap();
        assert!(ws.start(&base.join("assets/main.json").unwrap()));

        // a fresh connection gets the current manifest straight away
        assert!(eventually(LIMIT, || loader.count() == 2).await);

        write_marker(&assets, "2");
        assert!(eventually(LIMIT, || loader.count() == 4).await);
        assert_eq!(ws.connection_attempts(), 1);

        ws.shutdown();
        cancel.cancel();
        lock.close();
    }
}

mod server {
    use super::*;

    #[tokio::test]
    async fn test_post_answers_with_location_token() {
        let root = tempdir().unwrap();
        let assets = root.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        write_manifest(&assets.join("main.json"), &["a.mjs"]);
        write_marker(&assets, "42");

        let lock = Arc::new(LockCoordinator::new().unwrap());
        let (base, cancel) = dev_server(root.path(), lock.clone()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(base.join("assets/main.json?").unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.headers()["location"], "?42");
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body, serde_json::json!({"chunks": ["a.mjs"]}));

        // non-manifest POSTs are not long-polls
        let response = client
            .post(base.join("assets/a.mjs").unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        cancel.cancel();
        lock.close();
    }

    #[tokio::test]
    async fn test_static_assets_are_immutable() {
        let root = tempdir().unwrap();
        let assets = root.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("entry-main.1.mjs"), "export {};").unwrap();
        std::fs::write(root.path().join("index.html"), "<html></html>").unwrap();
        write_marker(&assets, "1");

        let lock = Arc::new(LockCoordinator::new().unwrap());
        let (base, cancel) = dev_server(root.path(), lock.clone()).await;

        let response = reqwest::get(base.join("assets/entry-main.1.mjs").unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.headers()["cache-control"]
            .to_str()
            .unwrap()
            .contains("immutable"));
        assert_eq!(response.text().await.unwrap(), "export {};");

        let response = reqwest::get(base.join("index.html").unwrap()).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.headers().get("cache-control").is_none());

        cancel.cancel();
        lock.close();
    }
}
