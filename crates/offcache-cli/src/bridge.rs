//! Stdio bridge for `offcache serve`.
//!
//! Each stdin line is either a JSON envelope or a control word:
//! `ONLINE`, `OFFLINE`, or `FETCH <url>`. Every message the worker sends to
//! the bridge context is written to stdout as one JSON line. `FETCH` reports
//! go through the same writer, so lines never interleave.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use offcache_core::clients::ClientConnection;
use offcache_core::http::Request;
use offcache_core::{Config, Envelope, Lifecycle, Worker};

/// Raw lines buffered between stdin and the worker
const INBOX_CAPACITY: usize = 64;

/// `FETCH` reports waiting for the writer
const REPORT_CAPACITY: usize = 16;

enum Control<'a> {
    Online(bool),
    Fetch(&'a str),
    Message,
}

fn parse_control(line: &str) -> Control<'_> {
    match line {
        "ONLINE" => Control::Online(true),
        "OFFLINE" => Control::Online(false),
        _ => match line.strip_prefix("FETCH ") {
            Some(url) => Control::Fetch(url.trim()),
            None => Control::Message,
        },
    }
}

/// Sole owner of `out`: writes every message addressed to the bridge context
/// and every report line, one per line. Stops when the context is closed.
fn spawn_writer<W>(
    mut out: W,
    mut connection: ClientConnection,
    mut reports: mpsc::Receiver<String>,
) -> tokio::task::JoinHandle<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                // reports first, so none is lost when the context closes
                biased;
                Some(report) = reports.recv() => report,
                message = connection.rx.recv() => {
                    let Some(message) = message else { break };
                    match Envelope::from_client(message, connection.id.clone()).encode() {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode outbound message");
                            continue;
                        }
                    }
                }
            };
            if out.write_all(format!("{}\n", line).as_bytes()).await.is_err()
                || out.flush().await.is_err()
            {
                break;
            }
        }
        out
    })
}

async fn fetch_line(worker: &Worker, config: &Config, raw_url: &str) -> String {
    let url = match config.origin_url().map(|o| o.join(raw_url)) {
        Ok(Ok(url)) => url,
        _ => return format!("FETCH {} invalid url", raw_url),
    };
    let request = Request::infer(url);

    match worker.handle_fetch(None, &request).await {
        Ok(routed) => format!("FETCH {} {}", request.url, Worker::describe(&routed)),
        Err(e) => format!("FETCH {} failed: {}", request.url, e),
    }
}

pub async fn serve(config: &Config) -> Result<()> {
    let worker = Arc::new(Worker::start(config).await?);

    if worker.lifecycle().await != Lifecycle::Activated {
        if let Err(e) = worker.install_and_activate().await {
            // keep serving; requests pass through to the network
            warn!(error = %e, "Worker did not activate");
        }
    }

    let connection = worker.connect().await;
    let bridge_id = connection.id.clone();
    let (report_tx, report_rx) = mpsc::channel(REPORT_CAPACITY);
    let writer = spawn_writer(tokio::io::stdout(), connection, report_rx);
    let reconciler = worker.spawn_reconciler();

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let runner = tokio::spawn(worker.clone().run(inbox_rx));

    info!(client = %bridge_id, lifecycle = %worker.lifecycle().await, "Bridge ready");
    eprintln!("offcache serving {} as client {}", config.origin, bridge_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_control(line) {
            Control::Online(online) => {
                worker.connectivity().set_online(online);
            }
            Control::Fetch(url) => {
                let report = fetch_line(&worker, config, url).await;
                if report_tx.send(report).await.is_err() {
                    break;
                }
            }
            Control::Message => {
                if inbox_tx.send(line.to_string()).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("Stdin closed, shutting down");
    drop(inbox_tx);
    drop(report_tx);
    runner.await?;
    reconciler.abort();
    // dropping the slot closes the channel, so the writer drains and exits
    worker.clients().disconnect(&bridge_id).await;
    writer.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offcache_core::clients::Clients;
    use offcache_core::WorkerMessage;

    #[test]
    fn test_parse_control() {
        assert!(matches!(parse_control("ONLINE"), Control::Online(true)));
        assert!(matches!(parse_control("OFFLINE"), Control::Online(false)));
        assert!(matches!(parse_control("FETCH /app.js "), Control::Fetch("/app.js")));
        assert!(matches!(parse_control(r#"{"type":"SYNC_WHEN_ONLINE"}"#), Control::Message));
        assert!(matches!(parse_control("online"), Control::Message));
    }

    #[tokio::test]
    async fn test_writer_owns_every_output_line() {
        let clients = Clients::new();
        let connection = clients.connect(None).await;
        let id = connection.id.clone();
        let (report_tx, report_rx) = mpsc::channel(REPORT_CAPACITY);
        let writer = spawn_writer(Vec::new(), connection, report_rx);

        report_tx.send("FETCH https://app.test/ network".to_string()).await.unwrap();
        assert!(clients.post(&id, WorkerMessage::ActionQueued { seq: 1 }).await);
        drop(report_tx);
        clients.disconnect(&id).await;

        let out = String::from_utf8(writer.await.unwrap()).unwrap();
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "FETCH https://app.test/ network");
        let decoded = Envelope::<WorkerMessage>::decode(lines[1]).unwrap();
        assert_eq!(decoded.message, WorkerMessage::ActionQueued { seq: 1 });
    }
}
