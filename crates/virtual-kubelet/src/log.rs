//! `log` contains the plumbing for answering `kubectl logs` requests.
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use hyper::body::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error};

/// Possible errors sending log data.
#[derive(Debug, Error)]
pub enum SendError {
    /// Client has disconnected.
    #[error("ChannelClosed")]
    ChannelClosed,
    /// An unexpected error occured.
    #[error("{0}")]
    Abnormal(anyhow::Error),
}

/// Client options for fetching logs, as sent by the API server on
/// `/containerLogs`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// The number of lines to stream back to the client.
    #[serde(rename = "tailLines")]
    pub tail: Option<i64>,
    /// The number of bytes to stream back to the client.
    pub limit_bytes: Option<i64>,
    /// Prefix every line with its timestamp.
    #[serde(default)]
    pub timestamps: bool,
    /// Keep the stream open after the current end of the log.
    #[serde(default)]
    pub follow: bool,
    /// Return the logs of the previous instance of the container.
    #[serde(default)]
    pub previous: bool,
    /// Only lines newer than this many seconds.
    pub since_seconds: Option<i64>,
    /// Only lines newer than this time.
    pub since_time: Option<DateTime<Utc>>,
}

/// Sender for streaming logs to client.
pub struct Sender {
    sender: hyper::body::Sender,
    opts: Options,
}

impl Sender {
    /// Create new `Sender` from `hyper::body::Sender`.
    pub fn new(sender: hyper::body::Sender, opts: Options) -> Self {
        Sender { sender, opts }
    }

    /// The options the client asked for.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Async send some data to a client.
    pub async fn send<B: Into<Bytes>>(&mut self, data: B) -> Result<(), SendError> {
        self.sender.send_data(data.into()).await.map_err(|e| {
            if e.is_closed() {
                debug!("channel closed.");
                SendError::ChannelClosed
            } else {
                error!(error = %e, "channel error");
                SendError::Abnormal(anyhow::Error::new(e))
            }
        })
    }
}

/// Forward every chunk of `chunks` to `sender` until either side ends.
///
/// A client hanging up is a normal end of the stream, not an error.
pub async fn stream<S, E>(chunks: S, mut sender: Sender) -> anyhow::Result<()>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut chunks = chunks;
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Error reading from log");
                // The client may already be gone, nothing more to report then.
                let _ = sender
                    .send(format!("Error reading from log: {}\n", e))
                    .await;
                return Err(e.into());
            }
        };
        match sender.send(chunk).await {
            Ok(()) => (),
            Err(SendError::ChannelClosed) => return Ok(()),
            Err(SendError::Abnormal(e)) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use hyper::Body;

    #[test]
    fn parses_kubelet_query_options() {
        let opts: Options = serde_json::from_value(serde_json::json!({
            "tailLines": 10,
            "follow": true,
            "sinceTime": "2021-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(opts.tail, Some(10));
        assert!(opts.follow);
        assert!(!opts.timestamps);
        assert!(opts.since_time.is_some());
        assert!(opts.limit_bytes.is_none());
    }

    #[tokio::test]
    async fn streams_chunks_until_the_end() {
        let (tx, body) = Body::channel();
        let sender = Sender::new(tx, Options::default());
        let chunks = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"one\n")),
            Ok(Bytes::from_static(b"two\n")),
        ]);
        let forward = tokio::spawn(stream(chunks, sender));
        let collected = hyper::body::to_bytes(body).await.unwrap();
        forward.await.unwrap().unwrap();
        assert_eq!(&collected[..], b"one\ntwo\n");
    }

    #[tokio::test]
    async fn a_closed_client_ends_the_stream_quietly() {
        let (tx, body) = Body::channel();
        drop(body);
        let sender = Sender::new(tx, Options::default());
        let chunks =
            futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"lost\n"))]);
        assert!(stream(chunks, sender).await.is_ok());
    }
}
