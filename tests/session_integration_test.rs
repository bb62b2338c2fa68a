//! End-to-end scenarios driven through the session front door, with
//! host-trace assertions on the oblivious access patterns.

use oblivium::common::{
    ItemPointer, BLCKSZ, F_BTHANDLER, F_HASHHANDLER, INVALID_OFFSET_NUMBER, OP_EQUAL,
    OP_GREATER_EQUAL,
};
use oblivium::host::{HostEvent, MemHost};
use oblivium::nbtree::BTP_LEAF;
use oblivium::ofile::heap::heap_page_init;
use oblivium::ofile::ost::ost_page_init;
use oblivium::ost::{OstPageOpaque, OST_P_NONE};
use oblivium::page::htup::{heap_form_tuple, heap_tuple_set_ctid};
use oblivium::page::itup::{
    index_form_tuple, index_tuple_set_info, index_tuple_set_tid, inner_tuple_set_downlink,
    INDEX_TUPLE_HEADER_LEN,
};
use oblivium::page::tupdesc::{PgAttribute, TupleDesc};
use oblivium::page::page_add_item;
use oblivium::session::{Session, SessionOptions, HALT_KEY};

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn char_attr_desc() -> Vec<u8> {
    PgAttribute {
        attlen: -1,
        attalign: b'c',
        attbyval: false,
    }
    .encode()
    .to_vec()
}

fn hash_session(host: std::sync::Arc<MemHost>, opts: SessionOptions) -> Session {
    Session::init_soe(
        host,
        "test_heap",
        "test_hash_idx",
        4,
        64,
        16384,
        16385,
        1078,
        F_HASHHANDLER,
        &char_attr_desc(),
        opts,
    )
    .unwrap()
}

fn btree_session(host: std::sync::Arc<MemHost>) -> Session {
    Session::init_soe(
        host,
        "test_heap",
        "test_bt_idx",
        16,
        128,
        16384,
        16386,
        1078,
        F_BTHANDLER,
        &char_attr_desc(),
        SessionOptions::default(),
    )
    .unwrap()
}

// S1: hash insert followed by an equality lookup returns the tuple once.
#[test]
fn test_s1_hash_insert_and_lookup() {
    init_tracing();
    let host = MemHost::new();
    let mut session = hash_session(
        host,
        SessionOptions {
            hash_ffactor: Some(10),
            estimated_tuples: 40.0,
            ..Default::default()
        },
    );

    session.insert(&heap_form_tuple(b"hello"), b"hello").unwrap();

    let tuple = session
        .get_tuple(OP_EQUAL, b"hello")
        .unwrap()
        .expect("first call returns the inserted tuple");
    assert_eq!(tuple.payload(), b"hello");

    assert!(
        session.get_tuple(OP_EQUAL, b"hello").unwrap().is_none(),
        "second call signals end-of-scan"
    );
    session.close().unwrap();
}

// S2: with ffactor 1 and two initial buckets, a handful of inserts forces
// splits, and every key remains reachable exactly once.
#[test]
fn test_s2_hash_split() {
    init_tracing();
    let host = MemHost::new();
    let mut session = hash_session(
        host,
        SessionOptions {
            hash_ffactor: Some(1),
            ..Default::default()
        },
    );

    let keys = ["alpha", "bravo", "charlie", "delta", "echo"];
    for key in keys {
        session
            .insert(&heap_form_tuple(key.as_bytes()), key.as_bytes())
            .unwrap();
    }

    for key in keys {
        let tuple = session
            .get_tuple(OP_EQUAL, key.as_bytes())
            .unwrap()
            .unwrap_or_else(|| panic!("{key} is found after splits"));
        assert_eq!(tuple.payload(), key.as_bytes());
        assert!(
            session.get_tuple(OP_EQUAL, key.as_bytes()).unwrap().is_none(),
            "{key} matches exactly once"
        );
    }
    session.close().unwrap();
}

// S3: filling the root leaf forces a root split; both the oldest and the
// newest key stay reachable afterwards.
#[test]
fn test_s3_btree_root_split() {
    init_tracing();
    let host = MemHost::new();
    let mut session = btree_session(host);

    let payload = "p".repeat(400);
    let n = 40u16;
    for i in 0..n {
        let key = format!("{payload}-{i:03}");
        session
            .insert(&heap_form_tuple(key.as_bytes()), key.as_bytes())
            .unwrap();
    }

    for probe in [0, n - 1] {
        let key = format!("{payload}-{probe:03}");
        let tuple = session
            .get_tuple(OP_EQUAL, key.as_bytes())
            .unwrap()
            .expect("key found after root split");
        assert_eq!(tuple.payload(), key.as_bytes());
        assert!(session.get_tuple(OP_EQUAL, key.as_bytes()).unwrap().is_none());
    }
    session.close().unwrap();
}

// S4: a range scan that starts mid-tree walks right siblings and returns
// the remaining keys in order.
#[test]
fn test_s4_btree_range_scan_over_leaves() {
    init_tracing();
    let host = MemHost::new();
    let mut session = btree_session(host);

    let payload = "q".repeat(400);
    let n = 40u16;
    for i in 0..n {
        let key = format!("{payload}-{i:03}");
        session
            .insert(&heap_form_tuple(key.as_bytes()), key.as_bytes())
            .unwrap();
    }

    let start = 15u16;
    let probe = format!("{payload}-{start:03}");
    let mut seen = Vec::new();
    loop {
        match session.get_tuple(OP_GREATER_EQUAL, probe.as_bytes()).unwrap() {
            Some(tuple) => seen.push(String::from_utf8(tuple.payload().to_vec()).unwrap()),
            None => break,
        }
    }

    assert_eq!(seen.len(), (n - start) as usize);
    let mut expected: Vec<String> = (start..n).map(|i| format!("{payload}-{i:03}")).collect();
    expected.sort();
    assert_eq!(seen, expected);
    session.close().unwrap();
}

/// Build one OST index page: optional high key, then `items` in order.
fn build_ost_page(
    leaf: bool,
    prev: u32,
    next: u32,
    high_key: Option<&[u8]>,
    items: &[(Vec<u8>, ItemPointer)],
    minus_infinity_downlink: Option<u32>,
) -> Vec<u8> {
    let desc = TupleDesc::single_char_key();
    let mut page = vec![0u8; BLCKSZ];
    ost_page_init(&mut page, 0);
    let mut opaque = OstPageOpaque::read(&page);
    opaque.prev = prev;
    opaque.next = next;
    opaque.flags = if leaf { BTP_LEAF } else { 0 };
    opaque.write(&mut page);

    if let Some(hk) = high_key {
        let itup = index_form_tuple(&desc, hk, false).unwrap();
        page_add_item(&mut page, &itup, INVALID_OFFSET_NUMBER, false, false).unwrap();
    }
    if let Some(downlink) = minus_infinity_downlink {
        let mut itup = vec![0u8; INDEX_TUPLE_HEADER_LEN];
        index_tuple_set_info(&mut itup, INDEX_TUPLE_HEADER_LEN as u16);
        inner_tuple_set_downlink(&mut itup, downlink);
        page_add_item(&mut page, &itup, INVALID_OFFSET_NUMBER, false, false).unwrap();
    }
    for (key, tid) in items {
        let mut itup = index_form_tuple(&desc, key, false).unwrap();
        index_tuple_set_tid(&mut itup, *tid);
        let off = page_add_item(&mut page, &itup, INVALID_OFFSET_NUMBER, false, false).unwrap();
        assert_ne!(off, INVALID_OFFSET_NUMBER);
    }
    page
}

fn ost_key(leaf: usize, item: usize) -> Vec<u8> {
    format!("key-{leaf:02}-{item}\0").into_bytes()
}

/// Load a 2-level forest (fanouts 4 and 16, 3 keys per leaf) plus the
/// backing heap block. Returns the session and the index reads expected
/// per probe.
fn loaded_ost_session(host: std::sync::Arc<MemHost>) -> Session {
    let mut session = Session::init_fsoe(
        host,
        "fsoe_heap",
        "fsoe_ost",
        4,
        vec![4, 16],
        16384,
        16387,
        &char_attr_desc(),
        SessionOptions {
            dummies: true,
            ..Default::default()
        },
    )
    .unwrap();

    // Heap block 0: one tuple per key, in leaf-major order.
    let mut heap_page = vec![0u8; BLCKSZ];
    heap_page_init(&mut heap_page, 0);
    let mut tid_of = Vec::new();
    for leaf in 0..16 {
        for item in 0..3 {
            let key = ost_key(leaf, item);
            let payload = &key[..key.len() - 1];
            let mut stored = heap_form_tuple(payload);
            let off = page_add_item(&mut heap_page, &stored, INVALID_OFFSET_NUMBER, false, true)
                .unwrap();
            assert_ne!(off, INVALID_OFFSET_NUMBER);
            let tid = ItemPointer::new(0, off);
            heap_tuple_set_ctid(&mut stored, tid);
            // Re-stamp the stored copy in place.
            let item_id = oblivium::page::page_get_item_id(&heap_page, off);
            let start = item_id.off as usize;
            heap_page[start..start + stored.len()].copy_from_slice(&stored);
            tid_of.push(tid);
        }
    }
    session.add_heap_block(&heap_page, 0).unwrap();

    // Level 2: sixteen leaves, three keys each, chained left to right.
    for leaf in 0..16usize {
        let next = if leaf == 15 {
            OST_P_NONE
        } else {
            (leaf + 1) as u32
        };
        let prev = if leaf == 0 { OST_P_NONE } else { (leaf - 1) as u32 };
        let high_key = if leaf == 15 {
            None
        } else {
            Some(ost_key(leaf + 1, 0))
        };
        let items: Vec<(Vec<u8>, ItemPointer)> = (0..3)
            .map(|item| (ost_key(leaf, item), tid_of[leaf * 3 + item]))
            .collect();
        let page = build_ost_page(
            true,
            prev,
            next,
            high_key.as_deref(),
            &items,
            None,
        );
        session.add_index_block(&page, leaf as u32, 2).unwrap();
    }

    // Level 1: four internal pages, four leaf downlinks each.
    for p in 0..4usize {
        let items: Vec<(Vec<u8>, ItemPointer)> = (1..4)
            .map(|k| {
                let leaf = p * 4 + k;
                (ost_key(leaf, 0), ItemPointer::new(leaf as u32, 0))
            })
            .collect();
        let page = build_ost_page(
            false,
            OST_P_NONE,
            OST_P_NONE,
            None,
            &items,
            Some((p * 4) as u32),
        );
        session.add_index_block(&page, p as u32, 1).unwrap();
    }

    // Level 0: the root, with downlinks to the four internal pages.
    let items: Vec<(Vec<u8>, ItemPointer)> = (1..4)
        .map(|p| (ost_key(p * 4, 0), ItemPointer::new(p as u32, 0)))
        .collect();
    let root = build_ost_page(false, OST_P_NONE, OST_P_NONE, None, &items, Some(0));
    session.add_index_block(&root, 0, 0).unwrap();

    session
}

fn index_reads(host: &MemHost, name: &str) -> usize {
    host.trace()
        .iter()
        .filter(|e| matches!(e, HostEvent::Read { name: n, .. } if n == name))
        .count()
}

// S5: an OST equality probe touches exactly L + 1 = 3 index pages, no
// matter which leaf holds the key.
#[test]
fn test_s5_ost_load_and_equal_depth_search() {
    init_tracing();
    let host = MemHost::new();
    let mut session = loaded_ost_session(host.clone());

    for (leaf, item) in [(7usize, 1usize), (0, 0), (15, 2)] {
        let key = ost_key(leaf, item);
        let probe = &key[..key.len() - 1];

        host.clear_trace();
        let tuple = session
            .get_tuple(OP_EQUAL, probe)
            .unwrap()
            .unwrap_or_else(|| panic!("key on leaf {leaf} found"));
        assert_eq!(tuple.payload(), probe);

        assert_eq!(
            index_reads(&host, "fsoe_ost"),
            3,
            "probe depth is uniform for leaf {leaf}"
        );
        assert_eq!(index_reads(&host, "fsoe_heap"), 1);

        // Drain the scan so the next probe starts fresh.
        while session.get_tuple(OP_EQUAL, probe).unwrap().is_some() {}
    }
    session.close().unwrap();
}

// S6: HALT tears the scan down mid-flight; a new scan then succeeds.
#[test]
fn test_s6_halt_releases_and_allows_new_scan() {
    init_tracing();
    let host = MemHost::new();
    let mut session = loaded_ost_session(host);

    let key = ost_key(3, 0);
    let probe = &key[..key.len() - 1];
    assert!(session.get_tuple(OP_EQUAL, probe).unwrap().is_some());

    assert!(session.get_tuple(OP_EQUAL, HALT_KEY).unwrap().is_none());

    let key2 = ost_key(9, 2);
    let probe2 = &key2[..key2.len() - 1];
    let tuple = session
        .get_tuple(OP_EQUAL, probe2)
        .unwrap()
        .expect("scan works after halt");
    assert_eq!(tuple.payload(), probe2);
    session.close().unwrap();
}

// I1: everything the host stores is ciphertext; the inserted plaintext
// never appears in any stored page or callback argument.
#[test]
fn test_encryption_discipline() {
    init_tracing();
    let host = MemHost::new();
    let mut session = hash_session(host.clone(), SessionOptions::default());

    let secret = b"super-secret-payload";
    session.insert(&heap_form_tuple(secret), secret).unwrap();
    session.close().unwrap();

    for name in ["test_heap", "test_hash_idx"] {
        for blkno in 0..host.nblocks(name) {
            let raw = host.raw_page(name, blkno as u32).unwrap();
            assert_eq!(raw.len(), BLCKSZ);
            assert!(
                !raw.windows(secret.len()).any(|w| w == secret),
                "plaintext leaked into {name} block {blkno}"
            );
        }
    }
}

// Inserting under one key never makes it visible under another.
#[test]
fn test_lookup_isolation_between_keys() {
    init_tracing();
    let host = MemHost::new();
    let mut session = hash_session(host, SessionOptions::default());

    session.insert(&heap_form_tuple(b"one"), b"one").unwrap();
    session.insert(&heap_form_tuple(b"two"), b"two").unwrap();

    let tuple = session.get_tuple(OP_EQUAL, b"one").unwrap().unwrap();
    assert_eq!(tuple.payload(), b"one");
    assert!(session.get_tuple(OP_EQUAL, b"one").unwrap().is_none());

    assert!(session.get_tuple(OP_EQUAL, b"three").unwrap().is_none());
    session.close().unwrap();
}
