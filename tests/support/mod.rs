//! Deterministic multi-rank harness.
//!
//! Runs several service state machines against one shared blob map and one
//! event fan-out, standing in for the content store and the broker. Effects
//! are carried out synchronously, so tests can observe exactly which loads,
//! stores, and events a step produced.

#![allow(dead_code)] // each test binary uses a different slice of the harness

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use tanoak::blobref::BlobRef;
use tanoak::config::KvsConfig;
use tanoak::dirent::DirEntry;
use tanoak::error::errno;
use tanoak::proto::Effect;
use tanoak::proto::ErrorEvent;
use tanoak::proto::Event;
use tanoak::proto::FenceRequest;
use tanoak::proto::GetRequest;
use tanoak::proto::Input;
use tanoak::proto::ReplySender;
use tanoak::proto::Request;
use tanoak::proto::RequestEnvelope;
use tanoak::proto::Response;
use tanoak::proto::SetRootEvent;
use tanoak::proto::TreeOp;
use tanoak::service::KvsService;

/// A set of ranks sharing a blob map and an event bus.
pub struct Cluster {
    pub ranks: Vec<KvsService>,
    pub blobs: HashMap<BlobRef, Value>,
    pub load_count: u64,
    pub setroots: Vec<SetRootEvent>,
    pub errors: Vec<ErrorEvent>,
}

impl Cluster {
    /// Boot a cluster: rank 0 seeds the root, replicas adopt it.
    pub fn new(nranks: u32, config: KvsConfig) -> Self {
        let ranks = (0..nranks)
            .map(|rank| KvsService::new(rank, config.clone()))
            .collect();
        let mut cluster = Cluster {
            ranks,
            blobs: HashMap::new(),
            load_count: 0,
            setroots: Vec::new(),
            errors: Vec::new(),
        };
        cluster.ranks[0].store_initial_root();
        cluster.pump();
        let (rootdir, rootseq) = {
            let (rootdir, rootseq) = cluster.ranks[0].root();
            (rootdir.clone(), rootseq)
        };
        for replica in cluster.ranks.iter_mut().skip(1) {
            replica.init_root(rootdir.clone(), rootseq);
        }
        cluster.pump();
        cluster
    }

    /// A reply channel pair for a client.
    pub fn client() -> (ReplySender, mpsc::UnboundedReceiver<Response>) {
        mpsc::unbounded_channel()
    }

    /// Deliver a request to a rank without pumping.
    pub fn send(&mut self, rank: usize, sender: &str, reply: &ReplySender, request: Request) {
        self.ranks[rank].handle_input(Input::Request(RequestEnvelope::new(
            sender,
            reply.clone(),
            request,
        )));
    }

    /// Carry out effects until the cluster is quiescent: answer content IO
    /// from the blob map, fan events out to every rank, relay fences to
    /// rank 0.
    pub fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for i in 0..self.ranks.len() {
                let effects = self.ranks[i].take_effects();
                for effect in effects {
                    progressed = true;
                    match effect {
                        Effect::Respond { envelope, response } => {
                            let _ = envelope.reply.send(response);
                        }
                        Effect::Publish(event) => {
                            match &event {
                                Event::SetRoot(ev) => self.setroots.push(ev.clone()),
                                Event::Error(ev) => self.errors.push(ev.clone()),
                                _ => {}
                            }
                            for rank in &mut self.ranks {
                                rank.handle_input(Input::Event(event.clone()));
                            }
                        }
                        Effect::Load { blobref } => {
                            self.load_count += 1;
                            let result =
                                self.blobs.get(&blobref).cloned().ok_or(errno::ENOENT);
                            self.ranks[i].handle_input(Input::LoadReply { blobref, result });
                        }
                        Effect::Store { blobref, value } => {
                            self.blobs.insert(blobref.clone(), value);
                            self.ranks[i].handle_input(Input::StoreReply {
                                blobref: blobref.clone(),
                                result: Ok(blobref),
                            });
                        }
                        Effect::Relay { request } => {
                            let (tx, _rx) = mpsc::unbounded_channel();
                            self.ranks[0].handle_input(Input::Request(RequestEnvelope::new(
                                format!("rank{i}"),
                                tx,
                                Request::RelayFence(request),
                            )));
                        }
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Advance every rank's epoch.
    pub fn heartbeat(&mut self, epoch: u64) {
        for rank in &mut self.ranks {
            rank.handle_input(Input::Event(Event::Heartbeat { epoch }));
        }
        self.pump();
    }

    /// Submit a single-participant fence on `rank` and return its response.
    pub fn fence(&mut self, rank: usize, name: &str, ops: Vec<TreeOp>) -> Response {
        let (tx, mut rx) = Self::client();
        self.send(
            rank,
            "fencer",
            &tx,
            Request::Fence(FenceRequest {
                name: name.into(),
                nprocs: 1,
                flags: 0,
                ops,
            }),
        );
        self.pump();
        rx.try_recv().expect("fence response")
    }

    /// Read `key` on `rank`.
    pub fn get(&mut self, rank: usize, key: &str, flags: u32) -> Response {
        let (tx, mut rx) = Self::client();
        self.send(
            rank,
            "getter",
            &tx,
            Request::Get(GetRequest {
                rootdir: None,
                key: key.into(),
                flags,
            }),
        );
        self.pump();
        rx.try_recv().expect("get response")
    }
}

/// A set operation writing an inline value.
pub fn set_op(key: &str, value: Value) -> TreeOp {
    TreeOp {
        key: key.into(),
        dirent: Some(DirEntry::FileVal(value)),
    }
}

/// A delete operation.
pub fn del_op(key: &str) -> TreeOp {
    TreeOp {
        key: key.into(),
        dirent: None,
    }
}
