//! Async shell around the service state machine.
//!
//! A node owns one [`KvsService`] and drives it from tokio channels: a
//! request queue fed by [`NodeHandle`]s, a broadcast event bus shared by
//! every rank (the broker seam), and an internal queue for content-store
//! completions. Effects are carried out as they are emitted; content IO runs
//! in spawned tasks so the dispatch loop never blocks, though a store that
//! answers immediately behaves like the synchronous path.
//!
//! Rank 0 seeds the initial root; replicas bootstrap with a `getroot`
//! round-trip to their upstream handle and then track setroot events.

use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::blobref;
use crate::blobref::BlobRef;
use crate::config::KvsConfig;
use crate::content::ContentStore;
use crate::error::errno;
use crate::proto::Effect;
use crate::proto::Event;
use crate::proto::Input;
use crate::proto::Request;
use crate::proto::RequestEnvelope;
use crate::proto::Response;
use crate::proto::RootResponse;
use crate::service::KvsService;

/// Client-side handle for submitting requests to a node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    requests: mpsc::UnboundedSender<RequestEnvelope>,
}

impl NodeHandle {
    /// Submit an envelope without waiting for a response. Used for watches
    /// (stream of responses) and fire-and-forget requests.
    pub fn send(&self, envelope: RequestEnvelope) {
        let _ = self.requests.send(envelope);
    }

    /// Submit a request and await its first response.
    pub async fn request(&self, sender: &str, request: Request) -> anyhow::Result<Response> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.send(RequestEnvelope::new(sender, tx, request));
        rx.recv().await.context("node dropped the request")
    }
}

/// One rank's service plus its IO plumbing.
pub struct KvsNode {
    service: KvsService,
    requests: mpsc::UnboundedReceiver<RequestEnvelope>,
    events_tx: broadcast::Sender<Event>,
    events_rx: broadcast::Receiver<Event>,
    io_tx: mpsc::UnboundedSender<Input>,
    io_rx: mpsc::UnboundedReceiver<Input>,
    content: Arc<dyn ContentStore>,
    upstream: Option<NodeHandle>,
}

impl KvsNode {
    /// Build a node on the shared event bus. Replicas (`rank != 0`) need an
    /// `upstream` handle for bootstrap and fence relay.
    pub fn new(
        rank: u32,
        config: KvsConfig,
        content: Arc<dyn ContentStore>,
        events: broadcast::Sender<Event>,
        upstream: Option<NodeHandle>,
    ) -> (Self, NodeHandle) {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let events_rx = events.subscribe();
        let node = KvsNode {
            service: KvsService::new(rank, config),
            requests: req_rx,
            events_tx: events,
            events_rx,
            io_tx,
            io_rx,
            content,
            upstream,
        };
        (node, NodeHandle { requests: req_tx })
    }

    /// Run the dispatch loop until every handle is dropped.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.bootstrap().await?;
        debug!(rank = self.service.rank(), "node serving");
        loop {
            tokio::select! {
                maybe = self.requests.recv() => match maybe {
                    Some(envelope) => self.step(Input::Request(envelope)),
                    None => break,
                },
                maybe = self.io_rx.recv() => {
                    if let Some(input) = maybe {
                        self.step(input);
                    }
                }
                event = self.events_rx.recv() => match event {
                    Ok(event) => self.step(Input::Event(event)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    async fn bootstrap(&mut self) -> anyhow::Result<()> {
        if self.service.rank() == 0 {
            self.service.store_initial_root();
            self.drain_effects();
            return Ok(());
        }
        let upstream = self
            .upstream
            .clone()
            .context("replica rank requires an upstream handle")?;
        let response = upstream.request("bootstrap", Request::GetRoot).await?;
        if response.errnum != 0 {
            bail!("getroot failed with errno {}", response.errnum);
        }
        let payload = response.payload.context("getroot carried no payload")?;
        let root: RootResponse =
            serde_json::from_value(payload).context("bad getroot payload")?;
        let rootdir = BlobRef::parse(&root.rootdir)
            .map_err(|e| anyhow::anyhow!("bad root reference: {e}"))?;
        self.service.init_root(rootdir, root.rootseq);
        self.drain_effects();
        Ok(())
    }

    fn step(&mut self, input: Input) {
        self.service.handle_input(input);
        self.drain_effects();
    }

    fn drain_effects(&mut self) {
        for effect in self.service.take_effects() {
            match effect {
                Effect::Respond { envelope, response } => {
                    // A gone client is not an error; its channel is simply
                    // closed.
                    let _ = envelope.reply.send(response);
                }
                Effect::Publish(event) => {
                    let _ = self.events_tx.send(event);
                }
                Effect::Load { blobref } => {
                    let content = self.content.clone();
                    let io = self.io_tx.clone();
                    tokio::spawn(async move {
                        let result = match content.load(&blobref).await {
                            Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
                                .map_err(|_| errno::EPROTO),
                            Err(e) => Err(e.errnum()),
                        };
                        let _ = io.send(Input::LoadReply { blobref, result });
                    });
                }
                Effect::Store { blobref, value } => {
                    let content = self.content.clone();
                    let io = self.io_tx.clone();
                    tokio::spawn(async move {
                        let data = Bytes::from(blobref::encode(&value));
                        let result = content.store(data).await.map_err(|e| e.errnum());
                        let _ = io.send(Input::StoreReply { blobref, result });
                    });
                }
                Effect::Relay { request } => match &self.upstream {
                    Some(upstream) => {
                        let (tx, _rx) = mpsc::unbounded_channel();
                        upstream.send(RequestEnvelope::new(
                            format!("rank{}", self.service.rank()),
                            tx,
                            Request::RelayFence(request),
                        ));
                    }
                    None => warn!("fence relay without an upstream handle"),
                },
            }
        }
    }
}
