//! Shared test helpers for integration tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hotswap::hmr::{ChunkLoader, RuntimeGraph};
use hotswap::task::TaskQueue;
use parking_lot::Mutex;
use url::Url;

/// Chunk loader that records every URL it is asked to load
#[derive(Debug, Default, Clone)]
pub struct RecordingLoader {
    loaded: Arc<Mutex<Vec<String>>>,
}

impl RecordingLoader {
    pub fn loaded(&self) -> Vec<String> {
        self.loaded.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.loaded.lock().len()
    }
}

impl ChunkLoader for RecordingLoader {
    fn load(&self, url: &Url) -> anyhow::Result<()> {
        self.loaded.lock().push(url.to_string());
        Ok(())
    }
}

/// Graph with a fresh task queue and a recording loader
pub fn graph() -> (Arc<RuntimeGraph>, RecordingLoader) {
    let loader = RecordingLoader::default();
    let graph = RuntimeGraph::new(Arc::new(TaskQueue::new()), Arc::new(loader.clone()));
    (Arc::new(graph), loader)
}

/// Write a generation marker the way a build does: temp file, then rename
pub fn write_marker(dir: &Path, token: &str) {
    std::fs::create_dir_all(dir).unwrap();
    let tmp = dir.join("lock.json.tmp");
    std::fs::write(&tmp, format!("{{\"token\":\"{}\"}}", token)).unwrap();
    std::fs::rename(&tmp, dir.join("lock.json")).unwrap();
}

/// Write a manifest listing `chunks`
pub fn write_manifest(path: &Path, chunks: &[&str]) {
    let manifest = hotswap::manifest::Manifest::new(chunks.iter().copied());
    std::fs::write(path, manifest.to_pretty_json().unwrap()).unwrap();
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn eventually<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
