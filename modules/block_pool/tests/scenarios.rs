//! End-to-end behaviour of the block pool against the in-memory ledger,
//! driven through the public API with the background loops running.

mod common;

use std::collections::BTreeMap;

use common::*;
use lattice_common::{BlockSource, ChainReader, ChainTarget, HashHeight};
use lattice_module_block_pool::{ChainDetail, ChainKind, PoolConfig};

fn current_of(details: &[ChainDetail]) -> ChainDetail {
    details
        .iter()
        .find(|c| c.kind == ChainKind::Current)
        .cloned()
        .expect("every pool has a current chain")
}

fn assert_contiguous(details: &[ChainDetail]) {
    for chain in details {
        assert_eq!(
            chain.head.height - chain.tail.height,
            chain.size as u64,
            "chain {} has a height gap",
            chain.id
        );
    }
}

#[tokio::test]
async fn in_order_account_blocks_commit_sequentially() {
    let h = harness();
    let a = address(1);
    let blocks = account_chain(a, 5);
    for block in &blocks {
        h.pool.add_account_block(a, block.clone(), BlockSource::RemoteBroadcast);
    }

    h.pool.start().unwrap();
    wait_until("all five blocks are persisted", || {
        h.ledger.account_head(&a).height == 5
    })
    .await;
    h.pool.stop().await.unwrap();

    assert_eq!(h.ledger.account_chain(&a), blocks);
    let current = current_of(&h.pool.account_chain_detail(&a));
    assert_eq!(current.head, blocks[4].hash_height());
    assert_eq!(current.tail, h.ledger.account_head(&a));

    // Nothing committed lingers anywhere in the pool
    assert_eq!(h.pool.account_pending_num(&a), 0);
    for block in &blocks {
        assert!(h.pool.account_block_info(&a, &block.hash).is_none());
    }
}

#[tokio::test]
async fn gap_is_fetched_once_and_then_filled() {
    let h = harness();
    let a = address(1);
    let blocks = account_chain(a, 5);
    for block in &blocks[..3] {
        h.pool.add_account_block(a, block.clone(), BlockSource::RemoteBroadcast);
    }
    h.pool.start().unwrap();
    wait_until("the first three blocks are persisted", || {
        h.ledger.account_head(&a).height == 3
    })
    .await;

    h.pool.add_account_block(a, blocks[4].clone(), BlockSource::RemoteBroadcast);
    wait_until("the missing parent is requested", || {
        !h.network.fetches().is_empty()
    })
    .await;
    settle().await;

    let fetches = h.network.fetches();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].target, ChainTarget::Account(a));
    assert_eq!(fetches[0].hash_height, blocks[3].hash_height());
    assert_eq!(fetches[0].count, 1);
    assert_eq!(h.ledger.account_head(&a).height, 3);
    assert_contiguous(&h.pool.account_chain_detail(&a));

    h.pool.add_account_block(a, blocks[3].clone(), BlockSource::RemoteFetch);
    wait_until("the filled chain is persisted", || {
        h.ledger.account_head(&a).height == 5
    })
    .await;
    h.pool.stop().await.unwrap();

    assert_eq!(h.ledger.account_chain(&a), blocks);
    assert_eq!(h.network.fetches().len(), 1);
}

#[tokio::test]
async fn snapshot_fork_switches_to_confirmed_branch() {
    let h = harness();
    let shared = empty_snapshots(HashHeight::genesis(), 9, 0);
    let nine = shared[8].hash_height();
    let ours = snapshot_on(nine, 100, BTreeMap::new());
    let theirs = snapshot_on(nine, 200, BTreeMap::new());
    for block in shared.iter().cloned().chain([ours.clone()]) {
        produce_snapshot(&h.pool, block);
    }
    assert_eq!(h.ledger.head_snapshot(), ours.hash_height());

    h.pool.add_snapshot_block(theirs.clone(), BlockSource::RemoteBroadcast);
    h.pool.compact();
    let before = h.pool.info().fork_version;

    h.pool.fork_snapshot_to(theirs.hash_height()).unwrap();

    // Everything above the common ancestor is gone from the store
    assert_eq!(h.ledger.head_snapshot(), nine);
    assert!(h.ledger.snapshot_block_at(10).is_none());
    assert!(h.ledger.get_snapshot_block_by_hash(&ours.hash).is_none());
    assert!(h.pool.info().fork_version > before);

    // The pool continues from the persisted head towards the new branch
    let current = current_of(&h.pool.snapshot_chain_detail());
    assert_eq!(current.tail, nine);
    assert_eq!(current.head, theirs.hash_height());

    h.pool.start().unwrap();
    wait_until("the confirmed branch is persisted", || {
        h.ledger.head_snapshot() == theirs.hash_height()
    })
    .await;
    h.pool.stop().await.unwrap();

    let details = h.pool.snapshot_chain_detail();
    assert_eq!(current_of(&details).tail, h.ledger.head_snapshot());
    assert!(h.pool.snapshot_block_info(&theirs.hash).is_none());
}

#[tokio::test]
async fn snapshot_confirmation_forks_account_chain() {
    let h = harness();
    let a = address(1);
    let ours = account_chain(a, 3);
    for block in &ours {
        h.pool.add_direct_account_block(a, block.clone()).unwrap();
    }
    let theirs = sends(a, ours[0].hash_height(), 3, Default::default(), 7);
    for block in &theirs {
        h.pool.add_account_block(a, block.clone(), BlockSource::RemoteBroadcast);
    }
    let confirmation = snapshot_on(
        HashHeight::genesis(),
        1,
        BTreeMap::from([(a, theirs[1].hash_height())]),
    );
    h.pool.add_snapshot_block(confirmation.clone(), BlockSource::RemoteBroadcast);
    let before = h.pool.info().fork_version;

    h.pool.start().unwrap();
    wait_until("the confirming snapshot is persisted", || {
        h.ledger.head_snapshot() == confirmation.hash_height()
    })
    .await;
    h.pool.stop().await.unwrap();

    let expected: Vec<_> = std::iter::once(ours[0].clone()).chain(theirs.clone()).collect();
    assert_eq!(h.ledger.account_chain(&a), expected);
    assert!(h.pool.info().fork_version > before);

    // The losing blocks are parked, never retried
    let details = h.pool.account_chain_detail(&a);
    assert!(details.iter().any(|c| c.parked && c.head == ours[2].hash_height()));
    assert_contiguous(&details);
}

#[tokio::test]
async fn rollback_reopens_received_sends() {
    let h = harness();
    let (x, y) = (address(1), address(2));
    let send = send_to(x, HashHeight::genesis(), y, 10);
    let recv = receive(y, HashHeight::genesis(), &send);
    h.pool.add_direct_account_block(x, send.clone()).unwrap();
    h.pool.add_direct_account_block(y, recv.clone()).unwrap();
    assert_eq!(h.ledger.received_by(&send.hash), Some((y, 1)));
    let before = h.pool.info().fork_version;

    h.pool.rollback_account_to(x, 0).unwrap();

    assert_eq!(h.ledger.account_head(&x), HashHeight::genesis());
    assert_eq!(h.ledger.account_head(&y), HashHeight::genesis());
    assert_eq!(h.ledger.received_by(&send.hash), None);
    assert!(h.pool.info().fork_version > before);

    // The rolled back account keeps its block aside, the cascaded one
    // queues its receive again
    h.pool.compact();
    let own = h.pool.account_chain_detail(&x);
    assert!(own.iter().any(|c| c.parked && c.head == send.hash_height()));
    assert!(current_of(&own).size == 0);
    let cascaded = current_of(&h.pool.account_chain_detail(&y));
    assert_eq!(cascaded.head, recv.hash_height());
    assert!(h.pool.exist_in_pool(&y, &send.hash));
}

#[tokio::test]
async fn timed_out_account_is_rolled_back_alone() {
    let h = harness_with(fast_config(), 2);
    let (x, y) = (address(1), address(2));
    let xs = account_chain(x, 2);
    for block in &xs {
        h.pool.add_direct_account_block(x, block.clone()).unwrap();
    }

    let first = snapshot_on(
        HashHeight::genesis(),
        1,
        BTreeMap::from([(x, xs[0].hash_height())]),
    );
    let rest = empty_snapshots(first.hash_height(), 3, 0);
    let head = rest[1].hash_height();
    for block in std::iter::once(first).chain(rest) {
        produce_snapshot(&h.pool, block);
    }

    let ys = sends(y, HashHeight::genesis(), 1, head.hash, 0);
    h.pool.add_direct_account_block(y, ys[0].clone()).unwrap();
    let untouched = serde_json::to_value(h.pool.account_chain_detail(&y)).unwrap();

    assert_eq!(h.pool.evict_timed_out().unwrap(), 1);

    assert_eq!(h.ledger.account_head(&x), xs[0].hash_height());
    assert_eq!(h.ledger.account_head(&y), ys[0].hash_height());
    assert_eq!(
        serde_json::to_value(h.pool.account_chain_detail(&y)).unwrap(),
        untouched
    );
    let evicted = h.pool.account_chain_detail(&x);
    assert!(evicted.iter().any(|c| c.parked && c.head == xs[1].hash_height()));

    // What remains is confirmed
    assert_eq!(h.pool.evict_timed_out().unwrap(), 0);
}

#[tokio::test]
async fn duplicate_deliveries_are_ignored() {
    let h = harness();
    let a = address(1);
    let blocks = account_chain(a, 2);
    h.pool.add_direct_account_block(a, blocks[0].clone()).unwrap();

    // Already persisted
    h.pool.add_account_block(a, blocks[0].clone(), BlockSource::RemoteBroadcast);
    // Pooled twice
    h.pool.add_account_block(a, blocks[1].clone(), BlockSource::RemoteBroadcast);
    h.pool.add_account_block(a, blocks[1].clone(), BlockSource::RemoteFetch);
    h.pool.compact();
    assert_eq!(h.pool.account_pending_num(&a), 1);

    h.pool.start().unwrap();
    wait_until("the pooled block is persisted", || {
        h.ledger.account_head(&a).height == 2
    })
    .await;
    h.pool.add_account_block(a, blocks[1].clone(), BlockSource::RemoteBroadcast);
    settle().await;
    h.pool.stop().await.unwrap();

    assert_eq!(h.ledger.account_chain(&a), blocks);
    assert_eq!(h.pool.account_pending_num(&a), 0);
    assert_eq!(h.ledger.stats().account_blocks, 2);
}

#[tokio::test]
async fn fork_to_current_head_is_a_noop() {
    let h = harness();
    let a = address(1);
    let blocks = account_chain(a, 3);
    for block in &blocks {
        h.pool.add_direct_account_block(a, block.clone()).unwrap();
    }
    let before = h.pool.info().fork_version;

    h.pool.fork_account_to(a, blocks[2].hash_height()).unwrap();
    h.pool.fork_account_to(a, blocks[1].hash_height()).unwrap();

    assert_eq!(h.pool.info().fork_version, before);
    assert_eq!(h.ledger.account_chain(&a), blocks);
    assert!(h.network.fetches().is_empty());
}

#[tokio::test]
async fn receive_of_unknown_send_completes_once_send_arrives() {
    let h = harness();
    let (x, y) = (address(1), address(2));
    let send = send_to(x, HashHeight::genesis(), y, 10);
    let recv = receive(y, HashHeight::genesis(), &send);

    h.pool.add_direct_account_block(y, recv.clone()).unwrap();
    assert!(h.pool.exist_in_pool(&y, &send.hash));
    let fetches = h.network.fetches_of(ChainTarget::Account(x));
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].hash_height, send.hash_height());

    h.pool.start().unwrap();
    h.pool.add_account_block(x, send.clone(), BlockSource::RemoteFetch);
    wait_until("the receive is persisted", || {
        h.ledger.account_head(&y) == recv.hash_height()
    })
    .await;
    h.pool.stop().await.unwrap();

    assert_eq!(h.ledger.received_by(&send.hash), Some((y, 1)));
    assert!(!h.pool.exist_in_pool(&y, &send.hash));
}

#[tokio::test]
async fn direct_batch_is_broadcast_and_rebroadcast_until_confirmed() {
    let h = harness();
    let (x, y) = (address(1), address(2));
    let incoming = send_to(x, HashHeight::genesis(), y, 10);
    h.pool.add_direct_account_block(x, incoming.clone()).unwrap();

    let recv = receive(y, HashHeight::genesis(), &incoming);
    let onward = send_to(y, recv.hash_height(), x, 4);
    h.pool
        .add_direct_account_blocks(y, recv.clone(), vec![onward.clone()])
        .unwrap();

    assert_eq!(h.ledger.account_head(&y), onward.hash_height());
    let broadcasts = h.network.account_broadcasts.lock().unwrap().clone();
    assert!(broadcasts.contains(&(y, vec![recv.hash_height(), onward.hash_height()])));

    // Both local accounts have unconfirmed blocks
    assert_eq!(h.pool.rebroadcast(), 3);

    let confirm = snapshot_on(
        HashHeight::genesis(),
        1,
        BTreeMap::from([(x, incoming.hash_height()), (y, onward.hash_height())]),
    );
    produce_snapshot(&h.pool, confirm.clone());
    assert_eq!(h.pool.rebroadcast(), 0);
    assert_eq!(
        h.network.snapshot_broadcasts.lock().unwrap().as_slice(),
        &[confirm.hash_height()]
    );
}

#[tokio::test]
async fn stopped_pool_can_restart() {
    let h = harness();
    let a = address(1);
    let blocks = account_chain(a, 2);

    h.pool.start().unwrap();
    assert!(h.pool.is_running());
    h.pool.stop().await.unwrap();
    assert!(!h.pool.is_running());

    h.pool.add_account_block(a, blocks[0].clone(), BlockSource::RemoteBroadcast);
    h.pool.add_account_block(a, blocks[1].clone(), BlockSource::RemoteBroadcast);
    h.pool.restart().await.unwrap();
    wait_until("blocks queued while stopped are persisted", || {
        h.ledger.account_head(&a).height == 2
    })
    .await;
    h.pool.stop().await.unwrap();
    assert!(h.pool.fatal_error().is_none());
}

#[tokio::test]
async fn conflicting_confirmation_leaves_persisted_state_alone() {
    let h = harness();
    let a = address(1);
    let ours = account_chain(a, 1).remove(0);
    h.pool.add_direct_account_block(a, ours.clone()).unwrap();
    let confirmed = snapshot_on(
        HashHeight::genesis(),
        1,
        BTreeMap::from([(a, ours.hash_height())]),
    );
    produce_snapshot(&h.pool, confirmed.clone());

    // A peer claims another block at the already confirmed height
    let theirs = sends(a, HashHeight::genesis(), 1, Default::default(), 5).remove(0);
    h.pool.add_account_block(a, theirs.clone(), BlockSource::RemoteBroadcast);
    let rewrite = snapshot_on(
        confirmed.hash_height(),
        2,
        BTreeMap::from([(a, theirs.hash_height())]),
    );
    h.pool.add_snapshot_block(rewrite.clone(), BlockSource::RemoteBroadcast);
    let before = h.pool.info().fork_version;

    h.pool.start().unwrap();
    wait_until("the snapshot reaches current", || {
        current_of(&h.pool.snapshot_chain_detail()).head == rewrite.hash_height()
    })
    .await;
    settle().await;
    h.pool.stop().await.unwrap();

    assert_eq!(h.ledger.head_snapshot(), confirmed.hash_height());
    assert!(h.ledger.get_snapshot_block_by_hash(&rewrite.hash).is_none());
    assert_eq!(h.ledger.account_chain(&a), vec![ours]);
    assert_eq!(h.ledger.confirmed_height(&a), 1);
    assert_eq!(h.pool.info().fork_version, before);
    assert!(h.network.fetches().is_empty());
}

#[tokio::test]
async fn committed_block_leaves_the_pool() {
    let h = harness();
    let a = address(1);
    let ours = sends(a, HashHeight::genesis(), 1, Default::default(), 1).remove(0);
    let theirs = sends(a, HashHeight::genesis(), 1, Default::default(), 2).remove(0);
    h.pool.add_account_block(a, ours.clone(), BlockSource::RemoteBroadcast);
    h.pool.add_account_block(a, theirs.clone(), BlockSource::RemoteBroadcast);
    h.pool.compact();
    assert!(h.pool.account_block_info(&a, &ours.hash).is_some());

    h.pool.add_direct_account_block(a, ours.clone()).unwrap();
    assert!(h.pool.account_block_info(&a, &ours.hash).is_none());

    h.pool.compact();
    h.pool.compact();
    assert!(h.pool.account_block_info(&a, &ours.hash).is_none());
    assert_eq!(h.ledger.account_chain(&a), vec![ours.clone()]);

    // The loser stays around as an unconfirmed alternative
    assert!(h.pool.account_block_info(&a, &theirs.hash).is_some());
    assert_eq!(h.pool.account_pending_num(&a), 1);
    let current = current_of(&h.pool.account_chain_detail(&a));
    assert_eq!(current.tail, ours.hash_height());
    assert_eq!(current.size, 0);
}

#[tokio::test]
async fn rejected_chain_is_skipped_then_dropped() {
    let config = PoolConfig {
        block_list_ms: 200,
        fail_threshold_ms: 300,
        ..fast_config()
    };
    let h = harness_with(config, 75);
    let (x, y) = (address(1), address(2));
    let send = send_to(x, HashHeight::genesis(), y, 10);
    let first = receive(y, HashHeight::genesis(), &send);
    h.pool.add_direct_account_block(x, send.clone()).unwrap();
    h.pool.add_direct_account_block(y, first.clone()).unwrap();

    // Receiving the same send twice is refused by the verifier
    let again = receive(y, first.hash_height(), &send);
    h.pool.add_account_block(y, again.clone(), BlockSource::RemoteBroadcast);
    let before = h.pool.info().fork_version;

    h.pool.start().unwrap();
    wait_until("the failing address is block-listed", || {
        h.pool.info().block_listed == 1
    })
    .await;
    let attempts = h.verifier.account_checks(&y);

    // Listed addresses are not retried, and one failure keeps current
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.verifier.account_checks(&y), attempts);
    let current = current_of(&h.pool.account_chain_detail(&y));
    assert_eq!(current.head, again.hash_height());

    // Once the failure outlasts the threshold the chain is demoted and
    // compaction discards it
    wait_until("the failed chain is discarded", || {
        h.pool.account_pending_num(&y) == 0
    })
    .await;
    h.pool.stop().await.unwrap();
    assert!(h.verifier.account_checks(&y) >= attempts + 2);
    assert!(h.pool.info().fork_version > before);
    assert_eq!(h.ledger.account_chain(&y), vec![first.clone()]);
    assert!(h.pool.account_chain_detail(&y).iter().all(|c| c.size == 0));

    // A rollback touching the address lifts its block-list entry
    assert_eq!(h.pool.info().block_listed, 1);
    h.pool.rollback_account_to(x, 0).unwrap();
    assert_eq!(h.pool.info().block_listed, 0);
    assert_eq!(h.ledger.account_head(&y), HashHeight::genesis());
}
