//! Workload telemetry over HTTP.
//!
//! A cloudlet answers `GET http://{ip}:{port}/info/currentclient` with a
//! response that never ends on its own: a sequence of JSON objects such as
//! `{"ClientCount": 12}`, usually one per line.  Frames may be split across
//! body chunks or share one, so the body is buffered and decoded one value
//! at a time.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};

use super::{TelemetrySource, WorkloadStream};
use crate::config::TelemetryConfig;
use crate::error::{Error, Result};
use crate::types::WorkloadStatusMessage;

/// Telemetry source that streams workload reports from each cloudlet's HTTP
/// endpoint.
#[derive(Debug, Clone)]
pub struct HttpTelemetry {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl HttpTelemetry {
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        // Only the connection attempt is bounded; the response body is
        // expected to stay open for as long as the cloudlet is registered.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };
        Ok(Self {
            client,
            port: config.port,
            path,
        })
    }

    pub fn endpoint(&self, ip: IpAddr) -> Result<reqwest::Url> {
        let url = format!("http://{}{}", SocketAddr::new(ip, self.port), self.path);
        reqwest::Url::parse(&url)
            .map_err(|e| Error::Tracker(format!("cannot parse URL {}: {}", url, e)))
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetry {
    async fn subscribe(&self, ip: IpAddr) -> Result<WorkloadStream> {
        let url = self.endpoint(ip)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Tracker(format!("cannot get service from {}: {}", url, e)))?
            .error_for_status()?;
        Ok(decode_frames(response.bytes_stream()))
    }
}

/// Incremental decoder for a byte stream of concatenated JSON workload
/// messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<WorkloadStatusMessage>> {
        let (next, consumed) = {
            let mut values = serde_json::Deserializer::from_slice(&self.buf)
                .into_iter::<WorkloadStatusMessage>();
            let next = values.next();
            (next, values.byte_offset())
        };
        match next {
            Some(Ok(status)) => {
                self.buf.drain(..consumed);
                Ok(Some(status))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(Error::Tracker(format!("malformed workload message: {}", e))),
            None => {
                // Only whitespace is buffered.
                self.buf.clear();
                Ok(None)
            }
        }
    }

    /// Whether bytes of an unfinished message are buffered.
    pub fn has_partial(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }
}

/// Turn a stream of body chunks into a stream of workload messages.
///
/// The returned stream yields at most one error and then ends.  A body that
/// ends in the middle of a message is an error; one that ends between
/// messages is a clean end of stream.
pub fn decode_frames<S, B, E>(chunks: S) -> WorkloadStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = (Box::pin(chunks), FrameDecoder::default(), false);
    stream::unfold(state, |(mut chunks, mut decoder, failed)| async move {
        if failed {
            return None;
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(status)) => return Some((Ok(status), (chunks, decoder, false))),
                Ok(None) => {}
                Err(e) => return Some((Err(e), (chunks, decoder, true))),
            }
            match chunks.next().await {
                Some(Ok(bytes)) => decoder.push(bytes.as_ref()),
                Some(Err(e)) => {
                    let err = Error::Tracker(format!("telemetry read failed: {}", e));
                    return Some((Err(err), (chunks, decoder, true)));
                }
                None if decoder.has_partial() => {
                    let err = Error::Tracker("stream ended mid-message".into());
                    return Some((Err(err), (chunks, decoder, true)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
