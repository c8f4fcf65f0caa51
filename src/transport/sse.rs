use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use url::Url;

use super::{header_map, Connection, TransportError};

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Only `event:` and `data:` fields are interpreted; multi-line data is
/// joined with `\n`. Chunks may split lines anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    partial: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if let Some(ev) = self.line(line.trim_end_matches('\r')) {
                out.push(ev);
            }
        }
        out
    }

    /// Flush a trailing event at end of stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(ev) = self.line(line.trim_end_matches('\r')) {
                return Some(ev);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data_lines.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(SseEvent { event, data })
    }
}

/// Decode a complete event-stream body.
pub fn decode_sse_events(body: &str) -> Vec<SseEvent> {
    let mut decoder = SseDecoder::default();
    let mut events = decoder.feed(body.as_bytes());
    events.extend(decoder.finish());
    events
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// MCP over server-sent events.
///
/// Inbound envelopes arrive on a long-lived GET stream. Outbound envelopes are
/// POSTed to the URL announced by the stream's `endpoint` event (or configured
/// explicitly).
pub struct SseConnection {
    label: String,
    http: reqwest::Client,
    base: Url,
    post_endpoint: Option<Url>,
    headers: HeaderMap,
    stream: ByteStream,
    decoder: SseDecoder,
    inbound: VecDeque<Vec<u8>>,
    ended: bool,
}

impl SseConnection {
    pub async fn open(
        label: &str,
        endpoint: Url,
        post_endpoint: Option<Url>,
        headers: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let headers = header_map(headers)?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let resp = http
            .get(endpoint.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(TransportError::Status {
                status: resp.status().as_u16(),
            });
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("text/event-stream") {
            return Err(TransportError::ContentType(content_type.to_string()));
        }

        Ok(Self {
            label: label.to_string(),
            http,
            base: endpoint,
            post_endpoint,
            headers,
            stream: Box::pin(resp.bytes_stream()),
            decoder: SseDecoder::default(),
            inbound: VecDeque::new(),
            ended: false,
        })
    }

    /// Read one chunk from the event stream. Returns `false` at end of stream.
    async fn pull(&mut self) -> Result<bool, TransportError> {
        match self.stream.next().await {
            Some(Ok(chunk)) => {
                for ev in self.decoder.feed(&chunk) {
                    self.accept(ev)?;
                }
                Ok(true)
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                if let Some(ev) = self.decoder.finish() {
                    self.accept(ev)?;
                }
                self.ended = true;
                Ok(false)
            }
        }
    }

    fn accept(&mut self, ev: SseEvent) -> Result<(), TransportError> {
        match ev.event.as_deref() {
            Some("endpoint") => {
                let url = self
                    .base
                    .join(ev.data.trim())
                    .map_err(|e| TransportError::Endpoint(format!("endpoint event: {e}")))?;
                tracing::debug!(label = %self.label, %url, "sse post endpoint announced");
                self.post_endpoint = Some(url);
            }
            _ => self.inbound.push_back(ev.data.into_bytes()),
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for SseConnection {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let post_url = loop {
            if let Some(url) = &self.post_endpoint {
                break url.clone();
            }
            if self.ended || !self.pull().await? {
                return Err(TransportError::Closed);
            }
        };

        // Replies come back on the stream; a rejected POST only loses its
        // own message.
        let result = self
            .http
            .post(post_url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(frame.to_vec())
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(label = %self.label, status = resp.status().as_u16(), "sse post rejected");
            }
            Ok(_) => {}
            Err(e) if e.is_connect() => return Err(e.into()),
            Err(e) => tracing::warn!(label = %self.label, error = %e, "sse post failed"),
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if let Some(frame) = self.inbound.pop_front() {
                return Ok(Some(frame));
            }
            if self.ended {
                return Ok(None);
            }
            self.pull().await?;
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.ended = true;
        self.stream = Box::pin(futures::stream::empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::transport::testing::{serve, Reply};

    #[tokio::test]
    async fn endpoint_event_sets_the_post_target() {
        let stream_body = format!(
            "event: endpoint\ndata: /messages?session=7\n\nevent: message\ndata: {}\n\n",
            json!({"jsonrpc": "2.0", "id": 1, "result": {}})
        );
        let (base, mut seen) = serve(move |req| match req.method.as_str() {
            "GET" => Reply::status(200)
                .header("content-type", "text/event-stream")
                .body(stream_body.clone()),
            _ => Reply::status(202),
        })
        .await;

        let mut conn = SseConnection::open("sse-test", base.join("sse").unwrap(), None, &HashMap::new())
            .await
            .unwrap();
        conn.send(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}")
            .await
            .unwrap();

        let get = seen.recv().await.unwrap();
        assert_eq!(get.method, "GET");
        assert_eq!(get.path, "/sse");
        assert_eq!(get.header("accept"), Some("text/event-stream"));
        let post = seen.recv().await.unwrap();
        assert_eq!(post.method, "POST");
        assert_eq!(post.path, "/messages?session=7");
        assert_eq!(post.body, "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}");

        let frame = conn.recv().await.unwrap().unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&frame).unwrap()["id"], 1);
        assert_eq!(conn.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejected_post_keeps_the_stream() {
        let (base, _seen) = serve(|req| match req.method.as_str() {
            "GET" => Reply::status(200)
                .header("content-type", "text/event-stream")
                .body("data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n\n"),
            _ => Reply::status(500),
        })
        .await;

        let mut conn = SseConnection::open(
            "sse-test",
            base.join("sse").unwrap(),
            Some(base.join("post").unwrap()),
            &HashMap::new(),
        )
        .await
        .unwrap();
        conn.send(b"{}").await.unwrap();
        let frame = conn.recv().await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&frame).unwrap()["method"],
            "notifications/message"
        );
        conn.close().await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_must_be_an_event_stream() {
        let (base, _seen) = serve(|_| Reply::json("{}")).await;
        let result = SseConnection::open("sse-test", base.join("sse").unwrap(), None, &HashMap::new()).await;
        assert!(matches!(result, Err(TransportError::ContentType(ct)) if ct == "application/json"));
    }

    #[test]
    fn decodes_single_event() {
        let ev = decode_sse_events("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(
            ev,
            vec![SseEvent {
                event: Some("message".into()),
                data: "{\"jsonrpc\":\"2.0\"}".into()
            }]
        );
    }

    #[test]
    fn joins_multiline_data_and_skips_comments() {
        let ev = decode_sse_events(": keepalive\ndata: a\ndata: b\n\n");
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].data, "a\nb");
        assert_eq!(ev[0].event, None);
    }

    #[test]
    fn chunks_may_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"event: endpoint\r\nda").is_empty());
        assert!(decoder.feed(b"ta: /messages?session=1\r").is_empty());
        let events = decoder.feed(b"\n\r\ndata: {}\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: Some("endpoint".into()),
                    data: "/messages?session=1".into()
                },
                SseEvent {
                    event: None,
                    data: "{}".into()
                }
            ]
        );
    }

    #[test]
    fn trailing_event_is_flushed() {
        let ev = decode_sse_events("data: last");
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].data, "last");
    }
}
