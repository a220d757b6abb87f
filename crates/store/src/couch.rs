//! CouchDB over HTTP.

use std::fmt;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use metrics::counter;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::{Body, Document, DocumentStore, StoreError, StoreResult, WriteResult};

#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Connection to one CouchDB server.
#[derive(Debug, Clone)]
pub struct CouchClient {
    http: reqwest::Client,
    base: Url,
    auth: Option<Credentials>,
    timeout: Option<Duration>,
}

impl CouchClient {
    pub fn new(base_url: &str, auth: Option<Credentials>) -> StoreResult<Self> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(StoreError::BaseUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base, auth, timeout: None })
    }

    /// Per-call timeout for every request except the continuous changes feed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn database(&self, name: &str) -> CouchDatabase {
        CouchDatabase { client: self.clone(), name: name.to_string() }
    }

    fn url_for(&self, segments: &[&str]) -> StoreResult<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StoreError::BaseUrl(self.base.to_string()))?;
            path.pop_if_empty();
            // push() percent-encodes '/' so ids like "Pod/ns/name" stay one segment
            for s in segments {
                path.push(s);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut req = self.http.request(method, url).header(reqwest::header::ACCEPT, "application/json");
        if let Some(auth) = &self.auth {
            if !auth.username.is_empty() || !auth.password.is_empty() {
                req = req.basic_auth(&auth.username, Some(&auth.password));
            }
        }
        req
    }

    async fn send(&self, method: Method, url: Url, if_match: Option<&str>, op: &'static str) -> StoreResult<Response> {
        self.send_json(method, url, if_match, None, op).await
    }

    async fn send_json(
        &self,
        method: Method,
        url: Url,
        if_match: Option<&str>,
        body: Option<&Body>,
        op: &'static str,
    ) -> StoreResult<Response> {
        counter!("kubist_store_requests_total", 1, "op" => op);
        let mut req = self.request(method, url);
        if let Some(t) = self.timeout {
            req = req.timeout(t);
        }
        if let Some(rev) = if_match {
            req = req.header(reqwest::header::IF_MATCH, rev);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }
}

/// One database on a [`CouchClient`].
#[derive(Debug, Clone)]
pub struct CouchDatabase {
    client: CouchClient,
    name: String,
}

impl CouchDatabase {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Follow the continuous `_changes` feed, sending each change row to `tx`
    /// until the feed ends, `stop` fires or the receiver goes away. Heartbeat
    /// blank lines are skipped. `tx` is dropped on return.
    pub async fn changes(&self, since: Option<&str>, tx: mpsc::Sender<Body>, stop: CancellationToken) -> StoreResult<()> {
        let mut url = self.client.url_for(&[&self.name, "_changes"])?;
        url.query_pairs_mut().append_pair("feed", "continuous").append_pair("heartbeat", "30000");
        if let Some(since) = since {
            url.query_pairs_mut().append_pair("since", since);
        }
        counter!("kubist_store_requests_total", 1, "op" => "changes");
        let res = self.client.request(Method::GET, url).send().await?;
        if !res.status().is_success() {
            let (status, body) = read_body(res).await?;
            return Err(status_error(status, body));
        }
        info!(db = %self.name, since = ?since, "changes feed opened");

        let stream = res.bytes_stream();
        futures::pin_mut!(stream);
        let mut buf = BytesMut::new();
        loop {
            tokio::select! {
                _ = stop.cancelled() => { debug!(db = %self.name, "changes feed stopped"); break; }
                next = stream.next() => {
                    match next {
                        Some(Ok(chunk)) => {
                            buf.extend_from_slice(&chunk);
                            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                                let line = buf.split_to(pos);
                                let _ = buf.split_to(1); // drop '\n'
                                if line.iter().all(u8::is_ascii_whitespace) {
                                    continue;
                                }
                                let row: Body = serde_json::from_slice(&line)?;
                                if tx.send(row).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            // last row without a trailing newline
                            if !buf.iter().all(u8::is_ascii_whitespace) {
                                let row: Body = serde_json::from_slice(&buf)?;
                                let _ = tx.send(row).await;
                            }
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentStore for CouchDatabase {
    async fn exists(&self) -> StoreResult<bool> {
        let url = self.client.url_for(&[&self.name])?;
        let res = self.client.send(Method::HEAD, url, None, "head").await?;
        match res.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(status, None)),
        }
    }

    async fn create(&self) -> StoreResult<()> {
        let url = self.client.url_for(&[&self.name])?;
        let res = self.client.send(Method::PUT, url, None, "create").await?;
        parse_response(res).await.map(|_| ())
    }

    async fn drop_database(&self) -> StoreResult<()> {
        let url = self.client.url_for(&[&self.name])?;
        let res = self.client.send(Method::DELETE, url, None, "drop").await?;
        parse_response(res).await.map(|_| ())
    }

    async fn get_or_none(&self, id: &str) -> StoreResult<Option<Document>> {
        let url = self.client.url_for(&[&self.name, id])?;
        let res = self.client.send(Method::GET, url, None, "get").await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = parse_response(res).await?;
        Document::from_body(body).map(Some)
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        let url = self.client.url_for(&[&self.name, id])?;
        let res = self.client.send(Method::GET, url, None, "get").await?;
        Document::from_body(parse_response(res).await?)
    }

    async fn put(&self, id: &str, mut body: Body, rev: Option<&str>) -> StoreResult<WriteResult> {
        let url = self.client.url_for(&[&self.name, id])?;
        body.insert("_id".into(), Value::String(id.to_string()));
        match rev {
            Some(r) => {
                body.insert("_rev".into(), Value::String(r.to_string()));
            }
            None => {
                body.remove("_rev");
            }
        }
        let res = self.client.send_json(Method::PUT, url, rev, Some(&body), "put").await?;
        write_result(parse_response(res).await?)
    }

    async fn delete(&self, doc: &Document) -> StoreResult<WriteResult> {
        if doc.id.is_empty() {
            return Err(StoreError::InvalidDocument { id: String::new(), field: "_id" });
        }
        if doc.rev.is_empty() {
            return Err(StoreError::InvalidDocument { id: doc.id.clone(), field: "_rev" });
        }
        let url = self.client.url_for(&[&self.name, &doc.id])?;
        let res = self.client.send(Method::DELETE, url, Some(&doc.rev), "delete").await?;
        write_result(parse_response(res).await?)
    }
}

async fn read_body(res: Response) -> StoreResult<(StatusCode, Option<Result<Body, serde_json::Error>>)> {
    let status = res.status();
    let bytes = res.bytes().await?;
    if bytes.is_empty() {
        return Ok((status, None));
    }
    Ok((status, Some(serde_json::from_slice::<Body>(&bytes))))
}

fn status_error(status: StatusCode, body: Option<Result<Body, serde_json::Error>>) -> StoreError {
    let body = body.and_then(|b| b.ok());
    let reason = body
        .as_ref()
        .and_then(|b| b.get("reason"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_default();
    StoreError::Status { code: status.as_u16(), reason, body }
}

async fn parse_response(res: Response) -> StoreResult<Body> {
    let (status, body) = read_body(res).await?;
    if status.is_client_error() || status.is_server_error() {
        return Err(status_error(status, body));
    }
    match body {
        Some(parsed) => Ok(parsed?),
        None => Ok(Body::new()),
    }
}

fn write_result(body: Body) -> StoreResult<WriteResult> {
    Ok(serde_json::from_value(Value::Object(body))?)
}
