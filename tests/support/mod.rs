#![allow(dead_code)]

use norkv::{
    FlashDevice, FlashImage, FlashOp, RecordHeader, SharedMemFlash, Store, StoreError,
    RECORD_HEADER_SIZE, SWAP_HEADER_SIZE, WORD_SIZE,
};
use std::collections::BTreeMap;

/// Region size used by most scenarios; small enough that a handful of
/// records triggers compaction.
pub const SWAP_SIZE: u32 = 2048;

pub type Observable = BTreeMap<u16, Vec<Vec<u8>>>;

pub fn open_store(swap_size: u32) -> (Store<SharedMemFlash>, SharedMemFlash) {
    let flash = SharedMemFlash::new(swap_size);
    let handle = flash.clone();
    let store = Store::open(flash).expect("open store");
    (store, handle)
}

/// Every value currently visible under `key`, in ordinal order.
pub fn chain(store: &Store<SharedMemFlash>, key: u16) -> Vec<Vec<u8>> {
    let mut values = Vec::new();
    loop {
        match store.get(key, values.len()) {
            Ok(value) => values.push(value),
            Err(StoreError::NotFound) => break,
            Err(err) => panic!("get({key}, {}) failed: {err}", values.len()),
        }
    }
    values
}

pub fn observable(store: &Store<SharedMemFlash>, keys: &[u16]) -> Observable {
    keys.iter().map(|&key| (key, chain(store, key))).collect()
}

/// Parses every record below `used` in `region`, committed or not.
pub fn records(handle: &SharedMemFlash, region: u8, used: u32) -> Vec<(u32, RecordHeader)> {
    let bytes = handle.region(region);
    let mut parsed = Vec::new();
    let mut offset = SWAP_HEADER_SIZE;
    while offset < used {
        let header_bytes: [u8; RECORD_HEADER_SIZE as usize] = bytes
            [offset as usize..(offset + RECORD_HEADER_SIZE) as usize]
            .try_into()
            .unwrap();
        let header = RecordHeader::decode(header_bytes);
        parsed.push((offset, header));
        offset += header.total_size();
    }
    parsed
}

/// Frontier invariant: word-aligned and everything past it erased.
pub fn assert_frontier_erased(store: &Store<SharedMemFlash>, handle: &SharedMemFlash) {
    let used = store.swap_used();
    assert_eq!(used % WORD_SIZE, 0, "frontier {used} is unaligned");
    let region = handle.region(store.swap_index());
    assert!(
        region[used as usize..].iter().all(|byte| *byte == 0xFF),
        "free space beyond {used} is not erased"
    );
}

pub fn apply(device: &mut SharedMemFlash, op: &FlashOp) {
    match op {
        FlashOp::Erase { region } => device.erase(*region).unwrap(),
        FlashOp::Write {
            region,
            offset,
            bytes,
        } => device.write(*region, *offset, bytes).unwrap(),
    }
}

/// Applies only the first `words` flash words of a write; erases stay
/// atomic in this model.
pub fn apply_partial(device: &mut SharedMemFlash, op: &FlashOp, words: usize) {
    match op {
        FlashOp::Erase { region } => device.erase(*region).unwrap(),
        FlashOp::Write {
            region,
            offset,
            bytes,
        } => {
            let len = (words * WORD_SIZE as usize).min(bytes.len());
            device.write(*region, *offset, &bytes[..len]).unwrap();
        }
    }
}

/// Reconstructs the flash from `pre_image` with `ops` replayed in order and
/// reopens a store on it.
pub fn reopen_after_ops(
    handle: &SharedMemFlash,
    pre_image: &FlashImage,
    ops: &[FlashOp],
) -> Store<SharedMemFlash> {
    handle.restore(pre_image);
    let mut device = handle.clone();
    for op in ops {
        apply(&mut device, op);
    }
    Store::open(handle.clone()).expect("recovery must succeed")
}

/// Replays every whole-operation prefix and every word-aligned partial
/// final write of `ops`, asserting the recovered observable state matches
/// the state before or after the operation.
pub fn assert_crash_consistent(
    handle: &SharedMemFlash,
    pre_image: &FlashImage,
    ops: &[FlashOp],
    keys: &[u16],
    pre_state: &Observable,
    post_state: &Observable,
) {
    for cut in 0..=ops.len() {
        let store = reopen_after_ops(handle, pre_image, &ops[..cut]);
        let state = observable(&store, keys);
        assert!(
            state == *pre_state || state == *post_state,
            "whole-op cut {cut}/{} recovered {state:?}",
            ops.len()
        );
    }
    for (idx, op) in ops.iter().enumerate() {
        let FlashOp::Write { bytes, .. } = op else {
            continue;
        };
        let words = bytes.len() / WORD_SIZE as usize;
        for cut_words in 1..words {
            handle.restore(pre_image);
            let mut device = handle.clone();
            for committed in &ops[..idx] {
                apply(&mut device, committed);
            }
            apply_partial(&mut device, op, cut_words);
            let store = Store::open(handle.clone()).expect("recovery must succeed");
            let state = observable(&store, keys);
            assert!(
                state == *pre_state || state == *post_state,
                "torn write {idx} at word {cut_words} recovered {state:?}"
            );
        }
    }
}
