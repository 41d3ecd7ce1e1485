//! reqwest-backed [`Transport`] driven cooperatively by `tick`.
//!
//! Requests run as tasks on a current-thread tokio runtime owned by the
//! client. The runtime only makes progress inside [`HttpClient::tick`],
//! so all I/O is interleaved with the page's own work and every event
//! is observed on the page thread.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::{FetchEvent, FetchEventKind, FetchRequest, RequestId, Transport};

pub struct HttpClient {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    events_tx: mpsc::UnboundedSender<FetchEvent>,
    events_rx: mpsc::UnboundedReceiver<FetchEvent>,
    tasks: HashMap<RequestId, tokio::task::JoinHandle<()>>,
    next_id: RequestId,
}

impl HttpClient {
    /// Build a client with its own current-thread runtime.
    ///
    /// # Errors
    /// Returns an error if the tokio runtime cannot be created.
    pub fn new() -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            client: reqwest::Client::new(),
            events_tx,
            events_rx,
            tasks: HashMap::new(),
            next_id: 1,
        })
    }

    fn drain(&mut self, out: &mut Vec<FetchEvent>) {
        while let Ok(ev) = self.events_rx.try_recv() {
            out.push(ev);
        }
        for ev in out.iter() {
            if matches!(ev.kind, FetchEventKind::Done | FetchEventKind::Failed(_)) {
                self.tasks.remove(&ev.request);
            }
        }
    }
}

impl Transport for HttpClient {
    fn request(&mut self, req: FetchRequest) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;

        debug!("HttpClient: {} {} (req {id})", req.method, req.url);
        let tx = self.events_tx.clone();
        let client = self.client.clone();
        let handle = self.runtime.spawn(async move {
            let mut builder = client.request(req.method, req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }
            match builder.send().await {
                Ok(mut resp) => {
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    let header = FetchEvent {
                        request: id,
                        kind: FetchEventKind::Header {
                            status: resp.status().as_u16(),
                            final_url: resp.url().clone(),
                            content_type,
                        },
                    };
                    if tx.send(header).is_err() {
                        return;
                    }
                    loop {
                        match resp.chunk().await {
                            Ok(Some(chunk)) => {
                                if tx
                                    .send(FetchEvent {
                                        request: id,
                                        kind: FetchEventKind::Data(chunk),
                                    })
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Ok(None) => {
                                let _ = tx.send(FetchEvent {
                                    request: id,
                                    kind: FetchEventKind::Done,
                                });
                                return;
                            }
                            Err(err) => {
                                let _ = tx.send(FetchEvent {
                                    request: id,
                                    kind: FetchEventKind::Failed(err.to_string()),
                                });
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(FetchEvent {
                        request: id,
                        kind: FetchEventKind::Failed(err.to_string()),
                    });
                }
            }
        });
        self.tasks.insert(id, handle);
        id
    }

    fn tick(&mut self, wait: Duration) -> Vec<FetchEvent> {
        let mut out = Vec::new();
        if self.tasks.is_empty() {
            // Nothing in flight; no need to park on the runtime.
            self.drain(&mut out);
            return out;
        }
        let first = self.runtime.block_on(async {
            tokio::time::timeout(wait, self.events_rx.recv())
                .await
                .ok()
                .flatten()
        });
        if let Some(ev) = first {
            out.push(ev);
        }
        self.drain(&mut out);
        out
    }

    fn abort(&mut self, id: RequestId) {
        if let Some(handle) = self.tasks.remove(&id) {
            warn!("HttpClient: aborting req {id}");
            handle.abort();
            let _ = self.events_tx.send(FetchEvent {
                request: id,
                kind: FetchEventKind::Failed("aborted".to_owned()),
            });
        }
    }

    fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
