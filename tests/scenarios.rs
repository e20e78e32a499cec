//! End-to-end scenarios across one or more ranks.

mod support;

use serde_json::json;
use serde_json::Value;

use support::del_op;
use support::set_op;
use support::Cluster;
use tanoak::config::KvsConfig;
use tanoak::dirent::DirEntry;
use tanoak::error::errno;
use tanoak::proto::FenceRequest;
use tanoak::proto::Request;
use tanoak::proto::SyncRequest;
use tanoak::proto::TreeOp;
use tanoak::proto::UnwatchRequest;
use tanoak::proto::WatchRequest;
use tanoak::proto::FLAG_FIRST;
use tanoak::proto::FLAG_ONCE;
use tanoak::proto::FLAG_READDIR;

#[test]
fn write_then_read_on_the_same_rank() {
    let mut cluster = Cluster::new(1, KvsConfig::default());

    let resp = cluster.fence(0, "f1", vec![set_op("a.b", json!(42))]);
    assert_eq!(resp.errnum, 0);
    assert_eq!(cluster.ranks[0].root().1, 1);

    let resp = cluster.get(0, "a.b", 0);
    assert_eq!(resp.payload.unwrap()["val"], json!(42));

    let resp = cluster.get(0, "a", FLAG_READDIR);
    let dir = resp.payload.unwrap();
    assert_eq!(dir["val"]["b"], json!({"FILEVAL": 42}));
}

#[test]
fn replica_reads_from_the_inlined_root() {
    let mut cluster = Cluster::new(2, KvsConfig::default());
    cluster.fence(0, "f1", vec![set_op("a.b", json!(42))]);

    // The setroot event inlined the root object, so the replica resolves
    // without a single content load.
    let loads_before = cluster.load_count;
    let resp = cluster.get(1, "a.b", 0);
    assert_eq!(resp.errnum, 0);
    assert_eq!(resp.payload.unwrap()["val"], json!(42));
    assert_eq!(cluster.load_count, loads_before);
}

#[test]
fn overlapping_fences_each_advance_the_root() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    let (tx2, mut rx2) = Cluster::client();
    let (tx3, mut rx3) = Cluster::client();
    cluster.send(
        0,
        "c2",
        &tx2,
        Request::Fence(FenceRequest {
            name: "f2".into(),
            nprocs: 1,
            flags: 0,
            ops: vec![set_op("x", json!(1))],
        }),
    );
    cluster.send(
        0,
        "c3",
        &tx3,
        Request::Fence(FenceRequest {
            name: "f3".into(),
            nprocs: 1,
            flags: 0,
            ops: vec![set_op("y", json!(2))],
        }),
    );
    cluster.pump();

    assert_eq!(rx2.try_recv().unwrap().errnum, 0);
    assert_eq!(rx3.try_recv().unwrap().errnum, 0);
    assert_eq!(cluster.ranks[0].root().1, 2);
    assert_eq!(cluster.get(0, "x", 0).payload.unwrap()["val"], json!(1));
    assert_eq!(cluster.get(0, "y", 0).payload.unwrap()["val"], json!(2));

    let seqs: Vec<u64> = cluster.setroots.iter().map(|ev| ev.rootseq).collect();
    assert_eq!(seqs.len(), 2);
    assert_ne!(seqs[0], seqs[1]);
}

#[test]
fn symlinks_follow_and_loop() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    cluster.fence(
        0,
        "f1",
        vec![TreeOp {
            key: "link".into(),
            dirent: Some(DirEntry::LinkVal("a.b".into())),
        }],
    );
    cluster.fence(0, "f2", vec![set_op("a.b", json!(7))]);

    let resp = cluster.get(0, "link", 0);
    assert_eq!(resp.payload.unwrap()["val"], json!(7));

    cluster.fence(
        0,
        "f3",
        vec![TreeOp {
            key: "loop".into(),
            dirent: Some(DirEntry::LinkVal("loop".into())),
        }],
    );
    let resp = cluster.get(0, "loop", 0);
    assert_eq!(resp.errnum, errno::ELOOP);
}

#[test]
fn watch_notifies_on_each_distinct_value() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    let (tx, mut rx) = Cluster::client();
    cluster.send(
        0,
        "watcher",
        &tx,
        Request::Watch(WatchRequest {
            key: "k".into(),
            val: Value::Null,
            flags: FLAG_FIRST,
        }),
    );
    cluster.pump();
    assert_eq!(rx.try_recv().unwrap().payload.unwrap()["val"], Value::Null);

    cluster.fence(0, "f1", vec![set_op("k", json!(1))]);
    assert_eq!(rx.try_recv().unwrap().payload.unwrap()["val"], json!(1));

    // Unchanged value: no notification.
    cluster.fence(0, "f2", vec![set_op("k", json!(1))]);
    assert!(rx.try_recv().is_err());

    cluster.fence(0, "f3", vec![set_op("k", json!(2))]);
    assert_eq!(rx.try_recv().unwrap().payload.unwrap()["val"], json!(2));
}

#[test]
fn watch_once_fires_a_single_time() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    let (tx, mut rx) = Cluster::client();
    cluster.send(
        0,
        "watcher",
        &tx,
        Request::Watch(WatchRequest {
            key: "k".into(),
            val: Value::Null,
            flags: FLAG_ONCE,
        }),
    );
    cluster.pump();
    assert!(rx.try_recv().is_err());

    cluster.fence(0, "f1", vec![set_op("k", json!(1))]);
    assert_eq!(rx.try_recv().unwrap().payload.unwrap()["val"], json!(1));

    cluster.fence(0, "f2", vec![set_op("k", json!(2))]);
    assert!(rx.try_recv().is_err());
}

#[test]
fn commit_error_reaches_every_requester_and_preserves_the_root() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    // A directory reference the content store cannot supply.
    let ghost = tanoak::HashAlgorithm::Blake3.hash_value(&json!({"ghost": 1}));
    let resp = cluster.fence(
        0,
        "f1",
        vec![
            TreeOp {
                key: "d".into(),
                dirent: Some(DirEntry::DirRef(ghost)),
            },
            set_op("d.x", json!(1)),
        ],
    );
    assert_eq!(resp.errnum, errno::ENOENT);
    assert_eq!(cluster.ranks[0].root().1, 0);
    assert_eq!(cluster.errors.len(), 1);
    assert_eq!(cluster.errors[0].names, vec!["f1".to_string()]);
}

#[test]
fn reading_a_dangling_value_reference_surfaces_the_load_error() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    // Writing a dangling reference succeeds; nothing dereferences it yet.
    let ghost = tanoak::HashAlgorithm::Blake3.hash_value(&json!("missing"));
    let resp = cluster.fence(
        0,
        "f1",
        vec![TreeOp {
            key: "v".into(),
            dirent: Some(DirEntry::FileRef(ghost)),
        }],
    );
    assert_eq!(resp.errnum, 0);

    // Two concurrent readers stall on the same entry; the failed load is
    // delivered to both.
    let (tx_a, mut rx_a) = Cluster::client();
    let (tx_b, mut rx_b) = Cluster::client();
    for reply in [&tx_a, &tx_b] {
        cluster.send(
            0,
            "reader",
            reply,
            Request::Get(tanoak::proto::GetRequest {
                rootdir: None,
                key: "v".into(),
                flags: 0,
            }),
        );
    }
    cluster.pump();
    assert_eq!(rx_a.try_recv().unwrap().errnum, errno::ENOENT);
    assert_eq!(rx_b.try_recv().unwrap().errnum, errno::ENOENT);

    // The failed entry was retired, so a later read retries the load.
    let loads_before = cluster.load_count;
    assert_eq!(cluster.get(0, "v", 0).errnum, errno::ENOENT);
    assert!(cluster.load_count > loads_before);
}

#[test]
fn fences_submitted_on_a_replica_are_relayed_and_answered() {
    let mut cluster = Cluster::new(2, KvsConfig::default());
    let resp = cluster.fence(1, "f1", vec![set_op("a", json!(5))]);
    assert_eq!(resp.errnum, 0);

    // Both ranks observe the new root.
    assert_eq!(cluster.ranks[0].root().1, 1);
    assert_eq!(cluster.ranks[1].root().1, 1);
    assert_eq!(cluster.get(1, "a", 0).payload.unwrap()["val"], json!(5));
}

#[test]
fn multi_participant_fence_waits_for_all_shares() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    let (tx, mut rx) = Cluster::client();
    cluster.send(
        0,
        "p1",
        &tx,
        Request::Fence(FenceRequest {
            name: "f".into(),
            nprocs: 2,
            flags: 0,
            ops: vec![set_op("a", json!(1))],
        }),
    );
    cluster.pump();
    assert!(rx.try_recv().is_err());
    assert_eq!(cluster.ranks[0].root().1, 0);

    let (tx2, mut rx2) = Cluster::client();
    cluster.send(
        0,
        "p2",
        &tx2,
        Request::Fence(FenceRequest {
            name: "f".into(),
            nprocs: 2,
            flags: 0,
            ops: vec![set_op("b", json!(2))],
        }),
    );
    cluster.pump();
    assert_eq!(rx.try_recv().unwrap().errnum, 0);
    assert_eq!(rx2.try_recv().unwrap().errnum, 0);
    assert_eq!(cluster.get(0, "a", 0).payload.unwrap()["val"], json!(1));
    assert_eq!(cluster.get(0, "b", 0).payload.unwrap()["val"], json!(2));
    assert_eq!(cluster.ranks[0].root().1, 1);
}

#[test]
fn sync_blocks_until_the_requested_version() {
    let mut cluster = Cluster::new(2, KvsConfig::default());
    let (tx, mut rx) = Cluster::client();
    cluster.send(1, "syncer", &tx, Request::Sync(SyncRequest { rootseq: 1 }));
    cluster.pump();
    assert!(rx.try_recv().is_err());

    cluster.fence(0, "f1", vec![set_op("a", json!(1))]);
    let resp = rx.try_recv().unwrap();
    assert_eq!(resp.payload.unwrap()["rootseq"], json!(1));

    // An already-satisfied sync answers immediately.
    let (tx2, mut rx2) = Cluster::client();
    cluster.send(1, "syncer", &tx2, Request::Sync(SyncRequest { rootseq: 1 }));
    cluster.pump();
    assert_eq!(rx2.try_recv().unwrap().errnum, 0);
}

#[test]
fn unwatch_purges_only_the_matching_watch() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    let (tx_a, mut rx_a) = Cluster::client();
    let (tx_b, mut rx_b) = Cluster::client();
    for (sender, reply, key) in [("wa", &tx_a, "a"), ("wb", &tx_b, "b")] {
        cluster.send(
            0,
            sender,
            reply,
            Request::Watch(WatchRequest {
                key: key.into(),
                val: Value::Null,
                flags: 0,
            }),
        );
    }
    cluster.pump();

    let (tx, mut rx) = Cluster::client();
    cluster.send(0, "wa", &tx, Request::Unwatch(UnwatchRequest { key: "a".into() }));
    cluster.pump();
    assert_eq!(rx.try_recv().unwrap().errnum, 0);

    cluster.fence(0, "f1", vec![set_op("a", json!(1)), set_op("b", json!(2))]);
    assert!(rx_a.try_recv().is_err());
    assert_eq!(rx_b.try_recv().unwrap().payload.unwrap()["val"], json!(2));
}

#[test]
fn disconnect_silences_every_waiter_of_the_sender() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    let (tx, mut rx) = Cluster::client();
    cluster.send(
        0,
        "goner",
        &tx,
        Request::Watch(WatchRequest {
            key: "k".into(),
            val: Value::Null,
            flags: 0,
        }),
    );
    cluster.send(0, "goner", &tx, Request::Sync(SyncRequest { rootseq: 5 }));
    cluster.pump();

    let (tx2, _rx2) = Cluster::client();
    cluster.send(0, "goner", &tx2, Request::Disconnect);
    cluster.pump();

    cluster.fence(0, "f1", vec![set_op("k", json!(1))]);
    assert!(rx.try_recv().is_err());
}

#[test]
fn root_version_never_regresses() {
    let mut cluster = Cluster::new(2, KvsConfig::default());
    let mut last = vec![0u64; 2];
    for i in 0..5 {
        cluster.fence(0, &format!("f{i}"), vec![set_op("k", json!(i))]);
        for (rank, last_seq) in last.iter_mut().enumerate() {
            let seq = cluster.ranks[rank].root().1;
            assert!(seq >= *last_seq);
            *last_seq = seq;
        }
    }
    assert_eq!(last, vec![5, 5]);

    // A stale setroot event must not rewind a replica.
    let stale = tanoak::proto::SetRootEvent {
        rootseq: 2,
        rootdir: cluster.setroots[1].rootdir.clone(),
        root: None,
        names: vec![],
    };
    cluster.ranks[1].handle_input(tanoak::proto::Input::Event(
        tanoak::proto::Event::SetRoot(stale),
    ));
    cluster.pump();
    assert_eq!(cluster.ranks[1].root().1, 5);
}

#[test]
fn deletes_and_rewrites_are_ordered_within_a_fence() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    cluster.fence(
        0,
        "f1",
        vec![
            set_op("k", json!(1)),
            del_op("k"),
            set_op("k", json!(3)),
            del_op("missing"),
        ],
    );
    assert_eq!(cluster.get(0, "k", 0).payload.unwrap()["val"], json!(3));

    cluster.fence(0, "f2", vec![del_op("k")]);
    assert_eq!(cluster.get(0, "k", 0).errnum, errno::ENOENT);
}

#[test]
fn ready_commits_merge_while_one_is_stalled() {
    let mut cluster = Cluster::new(1, KvsConfig::default());

    // Park a directory object in the content store but not in cache.
    let sub = json!({"x": {"FILEVAL": 1}});
    let sub_ref = tanoak::HashAlgorithm::Blake3.hash_value(&sub);
    cluster.blobs.insert(sub_ref.clone(), sub);
    cluster.fence(
        0,
        "setup",
        vec![TreeOp {
            key: "d".into(),
            dirent: Some(DirEntry::DirRef(sub_ref)),
        }],
    );
    cluster.heartbeat(100);
    let (tx, mut rx) = Cluster::client();
    cluster.send(0, "dropper", &tx, Request::DropCache);
    cluster.pump();
    let _ = rx.try_recv();

    // The first fence stalls loading `d`; two more become ready meanwhile
    // and merge into a single commit and a single root advance.
    let (tx_a, mut rx_a) = Cluster::client();
    let (tx_b, mut rx_b) = Cluster::client();
    let (tx_c, mut rx_c) = Cluster::client();
    for (reply, name, key) in [
        (&tx_a, "fa", "d.y"),
        (&tx_b, "fb", "p"),
        (&tx_c, "fc", "q"),
    ] {
        cluster.send(
            0,
            "fencer",
            reply,
            Request::Fence(FenceRequest {
                name: name.into(),
                nprocs: 1,
                flags: 0,
                ops: vec![set_op(key, json!(9))],
            }),
        );
    }
    let setroots_before = cluster.setroots.len();
    cluster.pump();

    for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
        assert_eq!(rx.try_recv().unwrap().errnum, 0);
    }
    let new_events = &cluster.setroots[setroots_before..];
    assert_eq!(new_events.len(), 2);
    let merged = new_events
        .iter()
        .find(|ev| ev.names.len() == 2)
        .expect("fb and fc merged");
    assert!(merged.names.contains(&"fb".to_string()));
    assert!(merged.names.contains(&"fc".to_string()));

    assert_eq!(cluster.get(0, "d.y", 0).payload.unwrap()["val"], json!(9));
    assert_eq!(cluster.get(0, "d.x", 0).payload.unwrap()["val"], json!(1));
    assert_eq!(cluster.get(0, "p", 0).payload.unwrap()["val"], json!(9));
}

#[test]
fn dropcache_event_expires_clean_entries_on_every_rank() {
    let mut cluster = Cluster::new(2, KvsConfig::default());
    cluster.fence(0, "f1", vec![set_op("a", json!(1))]);

    for rank in &mut cluster.ranks {
        rank.handle_input(tanoak::proto::Input::Event(tanoak::proto::Event::DropCache));
    }
    cluster.pump();

    // Reads still work; the cache reloads from the content store.
    let loads_before = cluster.load_count;
    assert_eq!(cluster.get(1, "a", 0).payload.unwrap()["val"], json!(1));
    assert!(cluster.load_count > loads_before);
}

#[test]
fn stats_expose_watchers_and_revision() {
    let mut cluster = Cluster::new(1, KvsConfig::default());
    let (tx, _rx) = Cluster::client();
    cluster.send(
        0,
        "watcher",
        &tx,
        Request::Watch(WatchRequest {
            key: "k".into(),
            val: Value::Null,
            flags: 0,
        }),
    );
    cluster.pump();

    let (tx2, mut rx2) = Cluster::client();
    cluster.send(0, "statter", &tx2, Request::StatsGet);
    cluster.pump();
    let payload = rx2.try_recv().unwrap().payload.unwrap();
    assert_eq!(payload["#watchers"], json!(1));
    assert_eq!(payload["store revision"], json!(0));

    let (tx3, mut rx3) = Cluster::client();
    cluster.send(0, "statter", &tx3, Request::StatsClear);
    cluster.pump();
    assert_eq!(rx3.try_recv().unwrap().errnum, 0);
}
