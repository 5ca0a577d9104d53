//! In-memory [`Fetcher`] for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use url::Url;

use super::fetch::{FetchError, FetchResponse, Fetcher};

#[derive(Debug, Clone)]
pub(crate) struct FakeRoute {
    reachable: bool,
    panics: bool,
    probe_type: Option<String>,
    get: Result<(Option<String>, Vec<u8>), u16>,
}

impl FakeRoute {
    /// A file served with the same content type for HEAD and GET.
    pub fn file(content_type: &str, body: &[u8]) -> Self {
        Self {
            reachable: true,
            panics: false,
            probe_type: Some(content_type.to_string()),
            get: Ok((Some(content_type.to_string()), body.to_vec())),
        }
    }

    /// Passes validation but the GET answers with `status`.
    pub fn broken_download(content_type: &str, status: u16) -> Self {
        Self {
            reachable: true,
            panics: false,
            probe_type: Some(content_type.to_string()),
            get: Err(status),
        }
    }

    pub fn untyped() -> Self {
        Self {
            reachable: true,
            panics: false,
            probe_type: None,
            get: Ok((None, Vec::new())),
        }
    }

    /// Passes validation, then the GET panics inside the worker.
    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::file("image/jpeg", b"")
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            panics: false,
            probe_type: None,
            get: Err(502),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeFetcher {
    routes: HashMap<String, FakeRoute>,
    fetch_delay: Option<Duration>,
    probed: Mutex<Vec<String>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, url: &str, route: FakeRoute) -> Self {
        self.routes.insert(url.to_string(), route);
        self
    }

    /// Delay every GET, to keep a pipeline in `processing` for a while.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    fn lookup(&self, url: &Url) -> Result<&FakeRoute, FetchError> {
        self.routes
            .get(url.as_str())
            .filter(|r| r.reachable)
            .ok_or_else(|| FetchError::Other(format!("connection refused: {}", url)))
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn probe(&self, url: &Url) -> Result<Option<String>, FetchError> {
        self.probed.lock().unwrap().push(url.to_string());
        Ok(self.lookup(url)?.probe_type.clone())
    }

    async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }

        let route = self.lookup(url)?;
        if route.panics {
            panic!("fetcher crashed on {}", url);
        }
        match &route.get {
            Ok((content_type, body)) => {
                let chunks: Vec<Result<Bytes, FetchError>> = body
                    .chunks(4)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(FetchResponse {
                    content_type: content_type.clone(),
                    body: futures::stream::iter(chunks).boxed(),
                })
            }
            Err(status) => Err(FetchError::Status(*status)),
        }
    }
}
