use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode};
use url::Url;

use super::sse::decode_sse_events;
use super::{header_map, Connection, TransportError};

const SESSION_HEADER: &str = "mcp-session-id";

/// What one POST brought back.
#[derive(Debug, Default)]
struct PostReply {
    session_id: Option<String>,
    frames: Vec<Vec<u8>>,
}

/// MCP over HTTP: one POST per outbound envelope.
///
/// POSTs run concurrently; [`Connection::send`] only starts one. Replies
/// arrive in the POST response bodies, either as `application/json` or as a
/// `text/event-stream` carrying one envelope per event, and are handed out by
/// [`Connection::recv`] as each POST completes.
///
/// A POST that fails without reaching the server ends the connection. Any
/// other failure only loses that POST's reply; the call it carried is left
/// to its request deadline.
pub struct HttpConnection {
    label: String,
    http: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    session_id: Option<String>,
    in_flight: FuturesUnordered<BoxFuture<'static, Result<PostReply, TransportError>>>,
    inbound: VecDeque<Vec<u8>>,
    closed: bool,
}

impl HttpConnection {
    /// `connect_timeout` bounds connection setup only; how long a call may
    /// take is the proxy's request timeout.
    pub fn open(
        label: &str,
        endpoint: Url,
        headers: &HashMap<String, String>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            label: label.to_string(),
            http,
            endpoint,
            headers: header_map(headers)?,
            session_id: None,
            in_flight: FuturesUnordered::new(),
            inbound: VecDeque::new(),
            closed: false,
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

async fn post(label: String, req: RequestBuilder) -> Result<PostReply, TransportError> {
    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) if e.is_connect() => return Err(e.into()),
        Err(e) => {
            tracing::warn!(label = %label, error = %e, "http request failed");
            return Ok(PostReply::default());
        }
    };

    let status = resp.status();
    let session_id = resp
        .headers()
        .get(SESSION_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    if status == StatusCode::ACCEPTED {
        return Ok(PostReply {
            session_id,
            frames: Vec::new(),
        });
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = match resp.text().await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(label = %label, error = %e, "reading http response failed");
            return Ok(PostReply {
                session_id,
                frames: Vec::new(),
            });
        }
    };
    if !status.is_success() {
        tracing::warn!(label = %label, status = status.as_u16(), "http error status");
    }
    tracing::debug!(label = %label, status = status.as_u16(), content_type = %content_type, "http response");

    Ok(PostReply {
        session_id,
        frames: body_frames(&label, &content_type, &body),
    })
}

/// Envelopes carried by a response body. Error statuses often carry a
/// JSON-RPC error, so the status is not consulted.
fn body_frames(label: &str, content_type: &str, body: &str) -> Vec<Vec<u8>> {
    let body = body.trim();
    if body.is_empty() {
        return Vec::new();
    }
    if content_type.starts_with("text/event-stream") {
        return decode_sse_events(body)
            .into_iter()
            .map(|ev| ev.data.into_bytes())
            .collect();
    }
    if content_type.is_empty()
        || content_type.starts_with("application/json")
        || body.starts_with('{')
    {
        return vec![body.as_bytes().to_vec()];
    }
    tracing::warn!(label, content_type, "dropping response body of unsupported type");
    Vec::new()
}

#[async_trait]
impl Connection for HttpConnection {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let mut req = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .body(frame.to_vec());
        if let Some(sid) = &self.session_id {
            req = req.header(SESSION_HEADER, sid);
        }
        self.in_flight.push(Box::pin(post(self.label.clone(), req)));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if let Some(frame) = self.inbound.pop_front() {
                return Ok(Some(frame));
            }
            if self.closed {
                return Ok(None);
            }
            if self.in_flight.is_empty() {
                // Nothing arrives between POSTs; wait until the caller sends again.
                std::future::pending::<()>().await;
            }
            if let Some(reply) = self.in_flight.next().await {
                let reply = reply?;
                if let Some(sid) = reply.session_id {
                    self.session_id = Some(sid);
                }
                self.inbound.extend(reply.frames);
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.in_flight = FuturesUnordered::new();

        if let Some(sid) = self.session_id.take() {
            let result = self
                .http
                .delete(self.endpoint.clone())
                .headers(self.headers.clone())
                .header(SESSION_HEADER, sid)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(label = %self.label, error = %e, "session delete failed");
            }
        }
        Ok(())
    }
}
