//! # 客户端会话驱动 / Client session driver
//!
//! `dial` opens the download leg (`GET <base><id>`), checks the preamble and
//! starts an uploader task that turns writes into sequenced
//! `POST <base><id>/<seq>` requests:
//!
//! - queued chunks are coalesced up to `max_upload_size` per request
//! - at most `max_concurrent_uploads` requests are in flight
//! - sequence numbers follow write order, not completion order
//! - the first failed upload is recorded and fails every later write; there
//!   is no retry

use crate::carrier::{self, BodyStream, Requester};
use crate::config::SplitHttpConfig;
use crate::conn::SplitConn;
use crate::dialer::{Dialer, IoStream};
use crate::error::TransportError;
use crate::router::DOWNLOAD_PREAMBLE;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::header::{HeaderName, HeaderValue};
use http::{header, HeaderMap, Method, Request};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Write queue depth between `SplitConn` and the uploader, in chunks.
const UPLOAD_QUEUE_DEPTH: usize = 64;

/// First upload failure, shared between the uploader and the connection.
#[derive(Debug, Default)]
pub(crate) struct UploadState {
    failure: Mutex<Option<String>>,
}

impl UploadState {
    pub(crate) fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    fn fail(&self, reason: String) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(reason);
        }
    }
}

/// Request template shared by the download and every upload.
#[derive(Clone)]
struct RequestTemplate {
    prefix: String,
    authority: HeaderValue,
    headers: HeaderMap,
}

impl RequestTemplate {
    fn new(config: &SplitHttpConfig, authority: &str, session_id: &str) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Config(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Config(format!("header value for {name}: {e}")))?;
            headers.insert(name, value);
        }
        Ok(Self {
            prefix: format!("{}{}", config.normalized_path(), session_id),
            authority: HeaderValue::from_str(authority)
                .map_err(|e| TransportError::Config(format!("host {authority:?}: {e}")))?,
            headers,
        })
    }

    fn build(&self, method: Method, path: String, body: Bytes) -> Result<Request<Bytes>, TransportError> {
        let mut req = Request::builder().method(method).uri(path).body(body)?;
        *req.headers_mut() = self.headers.clone();
        req.headers_mut().insert(header::HOST, self.authority.clone());
        Ok(req)
    }

    fn download(&self) -> Result<Request<Bytes>, TransportError> {
        self.build(Method::GET, self.prefix.clone(), Bytes::new())
    }

    fn upload(&self, seq: u64, data: Bytes) -> Result<Request<Bytes>, TransportError> {
        self.build(Method::POST, format!("{}/{}", self.prefix, seq), data)
    }
}

/// Open a split-HTTP connection to `host:port`.
pub async fn dial(host: &str, port: u16, config: &SplitHttpConfig) -> Result<SplitConn, TransportError> {
    let mut config = config.clone();
    config.apply_env_overrides();
    config.validate()?;

    let requester = timeout(config.dial_timeout(), carrier::dial(host, port, &config)).await??;
    let session_id = Uuid::new_v4().to_string();
    let authority = carrier::authority_for(host, port, &config);
    let template = RequestTemplate::new(&config, &authority, &session_id)?;

    let resp = timeout(config.dial_timeout(), requester.send(template.download()?)).await??;
    if !resp.status().is_success() {
        debug!(session = %session_id, status = %resp.status(), "download leg refused");
        return Err(TransportError::Status(resp.status()));
    }
    let download = timeout(config.dial_timeout(), strip_preamble(resp.into_body())).await??;
    debug!(
        session = %session_id,
        version = ?requester.version(),
        "split-http download leg established"
    );

    let (upload_tx, upload_rx) = mpsc::channel(UPLOAD_QUEUE_DEPTH);
    let state = Arc::new(UploadState::default());
    let uploader = tokio::spawn(run_uploader(
        upload_rx,
        requester.clone(),
        template,
        config.max_upload_size,
        config.max_concurrent_uploads,
        state.clone(),
    ));

    Ok(SplitConn::client(
        session_id,
        download,
        upload_tx,
        uploader,
        state,
        requester,
        config.max_upload_size,
    ))
}

/// Consume the `ok` preamble; bytes past it stay in the returned stream.
async fn strip_preamble(mut body: BodyStream) -> Result<BodyStream, TransportError> {
    let mut head = BytesMut::new();
    while head.len() < DOWNLOAD_PREAMBLE.len() {
        match body.next().await {
            Some(chunk) => head.extend_from_slice(&chunk?),
            None => {
                return Err(TransportError::Http(
                    "download ended before preamble".into(),
                ))
            }
        }
    }
    if &head[..DOWNLOAD_PREAMBLE.len()] != DOWNLOAD_PREAMBLE {
        return Err(TransportError::Http("unexpected download preamble".into()));
    }
    let rest = head.split_off(DOWNLOAD_PREAMBLE.len()).freeze();
    if rest.is_empty() {
        return Ok(body);
    }
    Ok(Box::pin(futures::stream::once(async move { Ok(rest) }).chain(body)))
}

async fn run_uploader(
    mut rx: mpsc::Receiver<Bytes>,
    requester: Arc<dyn Requester>,
    template: RequestTemplate,
    max_upload_size: usize,
    max_concurrent: usize,
    state: Arc<UploadState>,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut carry: Option<Bytes> = None;
    let mut seq: u64 = 0;

    loop {
        let first = match carry.take() {
            Some(chunk) => chunk,
            None => match rx.recv().await {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let mut segment = BytesMut::from(&first[..]);
        while segment.len() < max_upload_size {
            match rx.try_recv() {
                Ok(next) if segment.len() + next.len() <= max_upload_size => {
                    segment.extend_from_slice(&next)
                }
                Ok(next) => {
                    carry = Some(next);
                    break;
                }
                Err(_) => break,
            }
        }

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        if state.failure().is_some() {
            break;
        }

        let data = segment.freeze();
        let this_seq = seq;
        seq += 1;
        trace!(seq = this_seq, len = data.len(), "split-http upload queued");

        let requester = requester.clone();
        let template = template.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = upload_one(requester.as_ref(), &template, this_seq, data).await {
                warn!(seq = this_seq, error = %e, "split-http upload failed");
                #[cfg(feature = "metrics")]
                crate::metrics::global().upload_failures.inc();
                state.fail(e.to_string());
            }
        });
    }

    // all permits back means every in-flight upload has finished
    let all = u32::try_from(max_concurrent).unwrap_or(u32::MAX);
    let _ = permits.acquire_many(all).await;
    rx.close();
    debug!(uploads = seq, failed = state.failure().is_some(), "split-http uploader stopped");
}

async fn upload_one(
    requester: &dyn Requester,
    template: &RequestTemplate,
    seq: u64,
    data: Bytes,
) -> Result<(), TransportError> {
    let resp = requester.send(template.upload(seq, data)?).await?;
    let status = resp.status();
    // drain so HTTP/1.1 connections go back to the pool
    let mut body = resp.into_body();
    while let Some(chunk) = body.next().await {
        chunk?;
    }
    if !status.is_success() {
        return Err(TransportError::Status(status));
    }
    Ok(())
}

/// `Dialer` producing split-HTTP connections.
#[derive(Debug, Clone, Default)]
pub struct SplitHttpDialer {
    config: SplitHttpConfig,
}

impl SplitHttpDialer {
    pub fn new(config: SplitHttpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SplitHttpConfig {
        &self.config
    }
}

#[async_trait]
impl Dialer for SplitHttpDialer {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, TransportError> {
        Ok(Box::new(dial(host, port, &self.config).await?))
    }
}
