//! Source client for the FTS funding API: year-partitioned collections,
//! per-appeal cluster breakdowns and country fallback listings, served over
//! HTTP or from fixtures.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use fts_core::CollectionLevel;
use fts_storage::{FetchError, HttpFetcher};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value as JsonValue;
use tracing::debug;

mod countries;
mod splitter;

pub use countries::{
    is_blacklisted, normalize_countries, resolve_countries, CountryEntry, CountryListing,
    CountryLookup, GroupingEntry, COUNTRY_BLACKLIST, NO_COUNTRIES,
};
pub use splitter::{ItemSplitter, SplitError};

pub const CRATE_NAME: &str = "fts-source";

/// Raw entities of one collection, decoded as the consumer pulls them.
pub type ItemStream = BoxStream<'static, Result<JsonValue, FetchError>>;

/// Raw response body, one network read at a time.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, FetchError>>;

/// Upstream resources the pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Year { level: CollectionLevel, year: i32 },
    Countries(CountryLookup),
    Clusters(String),
}

impl Resource {
    pub fn path(&self) -> String {
        match self {
            Resource::Year { level, year } => format!("{}/year/{year}", level.as_str()),
            Resource::Countries(CountryLookup::Appeal(id)) => format!("project/appeal/{id}"),
            Resource::Countries(CountryLookup::Emergency(_)) => "funding".to_string(),
            Resource::Clusters(appeal_id) => format!("cluster/appeal/{appeal_id}"),
        }
    }

    pub fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            Resource::Countries(CountryLookup::Emergency(id)) => {
                vec![("groupby", "country".to_string()), ("emergency", id.clone())]
            }
            _ => Vec::new(),
        }
    }

    /// Path plus query, without base URL or suffix.
    pub fn describe(&self) -> String {
        let query = self.query();
        if query.is_empty() {
            return self.path();
        }
        format!("{}?{}", self.path(), encode_query(&query))
    }

    /// Relative location of the resource in a fixture tree. Query parameters
    /// become path segments so every resource maps to its own file.
    pub fn fixture_key(&self) -> String {
        match self {
            Resource::Countries(CountryLookup::Emergency(id)) => format!("funding/emergency/{id}"),
            _ => self.path(),
        }
    }
}

fn encode_query(query: &[(&'static str, String)]) -> String {
    query
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Renders `{base}/{path}{suffix}[?query]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub base_url: String,
    pub suffix: String,
}

impl Endpoints {
    pub fn new(base_url: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            suffix: suffix.into(),
        }
    }

    pub fn url(&self, resource: &Resource) -> String {
        let mut url = format!("{}/{}{}", self.base_url, resource.path(), self.suffix);
        let query = resource.query();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&encode_query(&query));
        }
        url
    }
}

#[async_trait]
pub trait FundingSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetches a small resource in one piece.
    async fn fetch_document(&self, resource: &Resource) -> Result<JsonValue, FetchError>;

    /// Opens a large resource and streams the entities at the configured item
    /// location.
    async fn open_collection(&self, resource: &Resource) -> Result<ItemStream, FetchError>;

    async fn fetch_year(
        &self,
        level: CollectionLevel,
        year: i32,
    ) -> Result<ItemStream, FetchError> {
        self.open_collection(&Resource::Year { level, year }).await
    }

    async fn fetch_countries(&self, lookup: &CountryLookup) -> Result<CountryListing, FetchError> {
        let resource = lookup.resource();
        let doc = self.fetch_document(&resource).await?;
        CountryListing::decode(doc)
            .map_err(|reason| FetchError::malformed(resource.describe(), reason))
    }

    async fn fetch_clusters(&self, appeal_id: &str) -> Result<Vec<JsonValue>, FetchError> {
        let resource = Resource::Clusters(appeal_id.to_string());
        match self.fetch_document(&resource).await? {
            JsonValue::Array(clusters) => Ok(clusters),
            _ => Err(FetchError::malformed(
                resource.describe(),
                "expected a list of clusters",
            )),
        }
    }
}

struct SplitState {
    origin: String,
    chunks: ByteStream,
    splitter: ItemSplitter,
    ready: VecDeque<JsonValue>,
    done: bool,
}

/// Turns a body stream into an item stream. A read is issued only when every
/// item decoded so far has been handed out.
pub fn split_stream(origin: String, location: &str, chunks: ByteStream) -> ItemStream {
    let state = SplitState {
        origin,
        chunks,
        splitter: ItemSplitter::new(location),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((Ok(item), st));
            }
            if st.done {
                return None;
            }
            match st.chunks.next().await {
                Some(Ok(bytes)) => match st.splitter.feed(&bytes) {
                    Ok(items) => st.ready.extend(items),
                    Err(err) => {
                        st.done = true;
                        let err = FetchError::malformed(st.origin.clone(), err);
                        return Some((Err(err), st));
                    }
                },
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(err), st));
                }
                None => {
                    st.done = true;
                    if let Err(err) = st.splitter.finish() {
                        let err = FetchError::malformed(st.origin.clone(), err);
                        return Some((Err(err), st));
                    }
                }
            }
        }
    })
    .boxed()
}

/// Live FTS API.
#[derive(Debug)]
pub struct HttpSource {
    http: HttpFetcher,
    endpoints: Endpoints,
    data_location: String,
}

impl HttpSource {
    pub fn new(http: HttpFetcher, endpoints: Endpoints, data_location: impl Into<String>) -> Self {
        Self {
            http,
            endpoints,
            data_location: data_location.into(),
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }
}

#[async_trait]
impl FundingSource for HttpSource {
    fn source_id(&self) -> &str {
        "fts-api"
    }

    async fn fetch_document(&self, resource: &Resource) -> Result<JsonValue, FetchError> {
        self.http.fetch_json(&self.endpoints.url(resource)).await
    }

    async fn open_collection(&self, resource: &Resource) -> Result<ItemStream, FetchError> {
        let url = self.endpoints.url(resource);
        debug!(%url, location = %self.data_location, "opening collection");
        let resp = self.http.open(&url).await?;

        let origin = url.clone();
        let chunks = stream::unfold(Some(resp), move |resp| {
            let origin = origin.clone();
            async move {
                let mut resp = resp?;
                match resp.chunk().await {
                    Ok(Some(bytes)) => Some((Ok(bytes.to_vec()), Some(resp))),
                    Ok(None) => None,
                    Err(source) => Some((
                        Err(FetchError::Body {
                            url: origin,
                            source,
                        }),
                        None,
                    )),
                }
            }
        })
        .boxed();

        Ok(split_stream(url, &self.data_location, chunks))
    }
}

/// Byte slice size used when replaying fixture collections.
pub const FIXTURE_SLICE_LEN: usize = 64;

/// Fixture-backed source. Documents come from an in-memory map first, then
/// from `<root>/<fixture key><suffix>`. Collections are replayed through the
/// same splitter as live responses, in small slices. Every request is logged.
#[derive(Debug)]
pub struct FixtureSource {
    documents: HashMap<String, Vec<u8>>,
    root: Option<PathBuf>,
    suffix: String,
    data_location: String,
    slice_len: usize,
    requests: Mutex<Vec<String>>,
}

impl FixtureSource {
    pub fn new(data_location: impl Into<String>) -> Self {
        Self {
            documents: HashMap::new(),
            root: None,
            suffix: ".json".to_string(),
            data_location: data_location.into(),
            slice_len: FIXTURE_SLICE_LEN,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_dir(
        root: impl Into<PathBuf>,
        suffix: impl Into<String>,
        data_location: impl Into<String>,
    ) -> Self {
        Self {
            root: Some(root.into()),
            suffix: suffix.into(),
            ..Self::new(data_location)
        }
    }

    pub fn with_document(self, resource: Resource, doc: &JsonValue) -> Self {
        self.with_raw(resource, doc.to_string())
    }

    pub fn with_raw(mut self, resource: Resource, body: impl Into<Vec<u8>>) -> Self {
        self.documents.insert(resource.fixture_key(), body.into());
        self
    }

    pub fn with_slice_len(mut self, slice_len: usize) -> Self {
        self.slice_len = slice_len.max(1);
        self
    }

    /// Fixture keys requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn load(&self, resource: &Resource) -> Result<Vec<u8>, FetchError> {
        let key = resource.fixture_key();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone());

        if let Some(body) = self.documents.get(&key) {
            return Ok(body.clone());
        }
        if let Some(root) = &self.root {
            let path = root.join(format!("{key}{}", self.suffix));
            match tokio::fs::read(&path).await {
                Ok(body) => return Ok(body),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(FetchError::Io {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }
        Err(FetchError::HttpStatus {
            status: 404,
            url: resource.describe(),
        })
    }
}

#[async_trait]
impl FundingSource for FixtureSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn fetch_document(&self, resource: &Resource) -> Result<JsonValue, FetchError> {
        let body = self.load(resource).await?;
        serde_json::from_slice(&body).map_err(|err| FetchError::malformed(resource.describe(), err))
    }

    async fn open_collection(&self, resource: &Resource) -> Result<ItemStream, FetchError> {
        let body = self.load(resource).await?;
        let slices: Vec<Result<Vec<u8>, FetchError>> = body
            .chunks(self.slice_len)
            .map(|slice| Ok(slice.to_vec()))
            .collect();
        Ok(split_stream(
            resource.describe(),
            &self.data_location,
            stream::iter(slices).boxed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fts_storage::{BackoffPolicy, HttpClientConfig};
    use futures::TryStreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn year(level: CollectionLevel, year: i32) -> Resource {
        Resource::Year { level, year }
    }

    /// Serves one response whose body is written in `piece_len` byte pieces
    /// with `pause` between them.
    async fn serve_slowly(body: &'static str, piece_len: usize, pause: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for piece in body.as_bytes().chunks(piece_len) {
                tokio::time::sleep(pause).await;
                if socket.write_all(piece).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
            }
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}")
    }

    fn live_source(base: &str, timeout: Duration) -> HttpSource {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            backoff: BackoffPolicy::single_attempt(),
            ..HttpClientConfig::default()
        })
        .expect("client");
        HttpSource::new(http, Endpoints::new(base, ".json"), "item")
    }

    #[tokio::test]
    async fn live_collection_outlasts_the_request_timeout() {
        let body = r#"[{"id":"E1"},{"id":"E2"},{"id":"E3"}]"#;
        let base = serve_slowly(body, 10, Duration::from_millis(400)).await;
        let source = live_source(&base, Duration::from_secs(1));

        let ids: Vec<JsonValue> = source
            .fetch_year(CollectionLevel::Emergency, 2015)
            .await
            .expect("open")
            .map_ok(|item| item["id"].clone())
            .try_collect()
            .await
            .expect("every item arrives");
        assert_eq!(ids, vec![json!("E1"), json!("E2"), json!("E3")]);
    }

    #[tokio::test]
    async fn stalled_collection_body_fails_as_a_body_error() {
        let body = r#"[{"id":"E1"},{"id":"E2"}]"#;
        let base = serve_slowly(body, 14, Duration::from_millis(600)).await;
        let source = live_source(&base, Duration::from_millis(200));

        let err = match source.fetch_year(CollectionLevel::Emergency, 2015).await {
            Ok(stream) => stream
                .try_collect::<Vec<JsonValue>>()
                .await
                .expect_err("idle read"),
            Err(err) => err,
        };
        assert!(
            matches!(err, FetchError::Body { .. } | FetchError::Request(_)),
            "{err:?}"
        );
    }

    #[test]
    fn endpoints_render_every_upstream_url() {
        let endpoints = Endpoints::new("http://fts.unocha.org/api/v1/", ".json");
        assert_eq!(
            endpoints.url(&year(CollectionLevel::Emergency, 2015)),
            "http://fts.unocha.org/api/v1/emergency/year/2015.json"
        );
        assert_eq!(
            endpoints.url(&year(CollectionLevel::Appeal, 2016)),
            "http://fts.unocha.org/api/v1/appeal/year/2016.json"
        );
        assert_eq!(
            endpoints.url(&Resource::Clusters("1043".into())),
            "http://fts.unocha.org/api/v1/cluster/appeal/1043.json"
        );
        assert_eq!(
            endpoints.url(&CountryLookup::Appeal("1043".into()).resource()),
            "http://fts.unocha.org/api/v1/project/appeal/1043.json"
        );
        assert_eq!(
            endpoints.url(&CountryLookup::Emergency("16506".into()).resource()),
            "http://fts.unocha.org/api/v1/funding.json?groupby=country&emergency=16506"
        );
    }

    #[tokio::test]
    async fn fixture_collection_streams_items_in_order() {
        let source = FixtureSource::new("item")
            .with_slice_len(3)
            .with_document(
                year(CollectionLevel::Emergency, 2015),
                &json!([{"id": "E1", "title": "Flood"}, {"id": "E2", "title": "Drought"}]),
            );

        let items: Vec<JsonValue> = source
            .fetch_year(CollectionLevel::Emergency, 2015)
            .await
            .expect("open")
            .try_collect()
            .await
            .expect("items");
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["title"], json!("Drought"));
        assert_eq!(source.requests(), vec!["emergency/year/2015".to_string()]);
    }

    #[tokio::test]
    async fn truncated_collection_yields_items_then_an_error() {
        let source = FixtureSource::new("item").with_raw(
            year(CollectionLevel::Appeal, 2015),
            r#"[{"id": "A1", "funding": 1}, {"id": "A2", "fund"#,
        );
        let mut stream = source
            .fetch_year(CollectionLevel::Appeal, 2015)
            .await
            .expect("open");

        let first = stream.next().await.expect("first").expect("ok");
        assert_eq!(first["id"], json!("A1"));
        let err = stream.next().await.expect("second").expect_err("truncated");
        assert!(matches!(err, FetchError::Malformed { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn missing_fixture_reads_as_not_found() {
        let source = FixtureSource::new("item");
        let err = source.fetch_clusters("A404").await.expect_err("missing");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn clusters_must_be_a_list() {
        let source = FixtureSource::new("item")
            .with_document(Resource::Clusters("A1".into()), &json!({"cluster": "HEALTH"}));
        let err = source.fetch_clusters("A1").await.expect_err("object");
        assert!(matches!(err, FetchError::Malformed { .. }));
    }

    #[tokio::test]
    async fn directory_fixtures_resolve_by_resource_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let appeal_dir = dir.path().join("cluster").join("appeal");
        std::fs::create_dir_all(&appeal_dir).expect("mkdir");
        std::fs::write(
            appeal_dir.join("A1.json"),
            r#"[{"cluster": "HEALTH", "funding": 5}]"#,
        )
        .expect("write clusters");
        let year_dir = dir.path().join("appeal").join("year");
        std::fs::create_dir_all(&year_dir).expect("mkdir");
        std::fs::write(
            year_dir.join("2016.json"),
            r#"{"data": [{"id": "A1"}], "total": 1}"#,
        )
        .expect("write year");

        let source = FixtureSource::from_dir(dir.path(), ".json", "data.item");
        let clusters = source.fetch_clusters("A1").await.expect("clusters");
        assert_eq!(clusters, vec![json!({"cluster": "HEALTH", "funding": 5})]);

        let appeals: Vec<JsonValue> = source
            .fetch_year(CollectionLevel::Appeal, 2016)
            .await
            .expect("open")
            .try_collect()
            .await
            .expect("items");
        assert_eq!(appeals, vec![json!({"id": "A1"})]);
    }
}
