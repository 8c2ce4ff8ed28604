use rmem::framework::ring::{RingBuf, RingCounter};

fn ring_over(backing: &mut Vec<u8>) -> RingBuf {
    unsafe { RingBuf::new(backing.as_mut_ptr(), backing.len()) }
}

#[test]
fn counter_hands_out_fifo_indices() {
    let mut ring = RingCounter::new(4);
    assert_eq!(ring.acquire(), Some(0));
    assert_eq!(ring.acquire(), Some(1));
    assert_eq!(ring.acquire(), Some(2));
    ring.release(0);
    ring.release(1);
    assert_eq!(ring.acquire(), Some(3));
    assert_eq!(ring.acquire(), Some(0));
}

#[test]
fn counter_exhaustion_fails_acquire() {
    let mut ring = RingCounter::new(2);
    assert!(ring.acquire().is_some());
    assert!(ring.acquire().is_some());
    assert_eq!(ring.acquire(), None);
}

#[test]
fn counter_out_of_order_release_parks_until_start_sweeps() {
    let mut ring = RingCounter::new(3);
    let a = ring.acquire().unwrap();
    let b = ring.acquire().unwrap();
    let c = ring.acquire().unwrap();
    // Releasing the middle slot first must not recycle it yet.
    ring.release(b);
    assert_eq!(ring.acquire(), None);
    ring.release(a);
    // The sweep freed a and b; c is still held.
    assert_eq!(ring.acquire(), Some(0));
    assert_eq!(ring.acquire(), Some(1));
    assert_eq!(ring.acquire(), None);
    ring.release(c);
    assert!(!ring.is_drained()); // the two re-acquired slots are live
}

#[test]
fn counter_drained_after_symmetric_use() {
    let mut ring = RingCounter::new(2);
    let a = ring.acquire().unwrap();
    let b = ring.acquire().unwrap();
    ring.release(a);
    ring.release(b);
    assert!(ring.is_drained());
}

#[test]
#[should_panic]
fn counter_double_release_is_fatal() {
    let mut ring = RingCounter::new(2);
    let a = ring.acquire().unwrap();
    ring.release(a);
    ring.release(a);
}

#[test]
fn buf_sequential_acquires_are_disjoint() {
    let mut backing = vec![0u8; 256];
    let base = backing.as_mut_ptr() as usize;
    let mut ring = ring_over(&mut backing);

    let a = ring.acquire(64, 8).unwrap() as usize;
    let b = ring.acquire(64, 8).unwrap() as usize;
    assert_eq!(a, base);
    assert_eq!(b, base + 64);
    ring.release(a as *mut u8);
    ring.release(b as *mut u8);
    assert!(ring.is_drained());
}

#[test]
fn buf_fresh_ring_places_at_buffer_start() {
    let mut backing = vec![0u8; 128];
    let base = backing.as_mut_ptr() as usize;
    let mut ring = ring_over(&mut backing);
    // start == end with nothing live: the whole buffer is usable.
    let a = ring.acquire(128, 1).unwrap() as usize;
    assert_eq!(a, base);
}

#[test]
fn buf_full_ring_fails_until_release() {
    let mut backing = vec![0u8; 128];
    let mut ring = ring_over(&mut backing);
    let a = ring.acquire(128, 1).unwrap();
    // start == end with one live allocation covering everything.
    assert!(ring.acquire(1, 1).is_none());
    ring.release(a);
    assert!(ring.acquire(1, 1).is_some());
}

#[test]
fn buf_wraps_after_head_release() {
    let mut backing = vec![0u8; 128];
    let base = backing.as_mut_ptr() as usize;
    let mut ring = ring_over(&mut backing);

    let a = ring.acquire(64, 1).unwrap();
    let b = ring.acquire(64, 1).unwrap();
    ring.release(a);
    // No room at the tail; the ring wraps and reuses the freed head.
    let c = ring.acquire(32, 1).unwrap() as usize;
    assert_eq!(c, base);
    ring.release(b);
    ring.release(c as *mut u8);
    assert!(ring.is_drained());
}

#[test]
fn buf_wrapped_acquire_respects_live_tail() {
    let mut backing = vec![0u8; 128];
    let mut ring = ring_over(&mut backing);

    let a = ring.acquire(64, 1).unwrap();
    let _b = ring.acquire(64, 1).unwrap();
    ring.release(a);
    // 64 free bytes at the head; a 65-byte request cannot fit.
    assert!(ring.acquire(65, 1).is_none());
    assert!(ring.acquire(64, 1).is_some());
}

#[test]
fn buf_alignment_inserts_padding() {
    let mut backing = vec![0u8; 256];
    let mut ring = ring_over(&mut backing);

    let a = ring.acquire(10, 1).unwrap();
    let b = ring.acquire(16, 64).unwrap();
    assert_eq!(b as usize % 64, 0);
    ring.release(a);
    ring.release(b);
    assert!(ring.is_drained());
}

#[test]
fn buf_release_order_does_not_block_drain() {
    let mut backing = vec![0u8; 256];
    let mut ring = ring_over(&mut backing);

    let a = ring.acquire(32, 1).unwrap();
    let b = ring.acquire(32, 1).unwrap();
    let c = ring.acquire(32, 1).unwrap();
    ring.release(c);
    ring.release(a);
    ring.release(b);
    assert!(ring.is_drained());
}

#[test]
fn buf_oversized_request_fails_fast() {
    let mut backing = vec![0u8; 64];
    let mut ring = ring_over(&mut backing);
    assert!(ring.acquire(65, 1).is_none());
}

#[test]
#[should_panic]
fn buf_unknown_release_is_fatal() {
    let mut backing = vec![0u8; 64];
    let mut ring = ring_over(&mut backing);
    let mut other = 0u8;
    ring.release(&mut other as *mut u8);
}

#[test]
#[should_panic]
fn buf_double_release_is_fatal() {
    let mut backing = vec![0u8; 64];
    let mut ring = ring_over(&mut backing);
    let a = ring.acquire(16, 1).unwrap();
    ring.release(a);
    ring.release(a);
}
