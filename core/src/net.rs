use std::collections::HashMap;
use std::io::{Read, Write};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, RANGE};

use crate::error::{TransferError, TransferResult};

pub const HTTP_PARTIAL: u16 = 206;

/// One request issued against a transport on behalf of a single transfer.
/// `range_start` makes it an open-ended ranged read from that offset.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub range_start: Option<u64>,
    pub user_agent: String,
}

impl TransferRequest {
    pub fn new(url: String, user_agent: String) -> Self {
        Self {
            url,
            headers: HashMap::new(),
            range_start: None,
            user_agent,
        }
    }

    pub fn with_range_start(mut self, offset: u64) -> Self {
        self.range_start = Some(offset);
        self
    }
}

/// Response handed back by a transport. `body` yields the raw bytes of the
/// requested range; `content_md5` is an optional server-side digest of the
/// whole resource, hex-encoded.
pub struct TransportResponse {
    pub status_code: u16,
    pub is_successful: bool,
    pub content_length: i64,
    pub content_md5: Option<String>,
    pub body: Box<dyn Read + Send>,
}

impl TransportResponse {
    /// A partial response means the source honored the ranged read.
    pub fn is_partial(&self) -> bool {
        self.status_code == HTTP_PARTIAL
    }
}

/// Capability set the engine needs from a wire protocol. Standard ranged
/// HTTP and custom file-server protocols both fit behind this trait.
pub trait Transport: Send + Sync {
    /// Open a request. `Ok(None)` means the transport produced no response
    /// at all, for example a handshake timeout.
    fn execute(&self, req: &TransferRequest) -> TransferResult<Option<TransportResponse>>;

    /// Writable stream for the final output. `None` tells the merger to open
    /// the destination file itself.
    fn open_output(
        &self,
        _req: &TransferRequest,
        _offset: u64,
    ) -> TransferResult<Option<Box<dyn Write + Send>>> {
        Ok(None)
    }

    /// Release any connection held for `response`. Transports that pool
    /// connections override this.
    fn disconnect(&self, _response: TransportResponse) {}

    /// Desired bytes per chunk for this resource, or `None` to let the
    /// planner decide from the total size.
    fn chunk_size_hint(&self, _req: &TransferRequest, _total: u64) -> Option<u64> {
        None
    }
}

/// Reachability oracle consumed by the network-loss reclassification.
pub trait NetworkMonitor: Send + Sync {
    fn is_network_available(&self) -> bool;
}

/// Default monitor for environments without a reachability probe.
#[derive(Debug, Clone, Default)]
pub struct AlwaysOnline;

impl NetworkMonitor for AlwaysOnline {
    fn is_network_available(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> TransferResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|err| TransferError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(&self, req: &TransferRequest) -> TransferResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| TransferError::Network(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| TransferError::Network(err.to_string()))?;
            headers.insert(name, value);
        }
        if let Some(start) = req.range_start {
            let value = format!("bytes={}-", start);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value)
                    .map_err(|err| TransferError::Network(err.to_string()))?,
            );
        }
        Ok(headers)
    }
}

impl Transport for HttpTransport {
    fn execute(&self, req: &TransferRequest) -> TransferResult<Option<TransportResponse>> {
        let response = self
            .client
            .get(&req.url)
            .headers(self.request_headers(req)?)
            .send()
            .map_err(|err| TransferError::Network(err.to_string()))?;
        let status = response.status();
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(-1);
        Ok(Some(TransportResponse {
            status_code: status.as_u16(),
            is_successful: status.is_success(),
            content_length,
            content_md5: None,
            body: Box::new(response),
        }))
    }
}
