//! Frame conservation and monotonicity invariants, checked at the model
//! level against the UMEM free-list (the actual four rings require a live
//! NIC/kernel and are exercised manually, not under `cargo test`).

use validator_ingress::umem::{Frame, PageAlignedMemory, SliceUmem, Umem};

#[test]
fn frame_conservation_across_reserve_and_release_cycles() {
    let frame_count = 32;
    let mut memory = PageAlignedMemory::alloc(4096, frame_count).unwrap();
    let umem = SliceUmem::new(&mut memory, 4096).unwrap();

    let mut held = Vec::new();
    for _ in 0..frame_count {
        held.push(umem.reserve().expect("frame available").offset());
    }
    assert_eq!(umem.available() + held.len(), frame_count);
    assert_eq!(umem.available(), 0);

    // release half, simulating frames returning from the kernel via RX/Completion.
    for offset in held.drain(..frame_count / 2) {
        umem.release(offset);
    }
    assert_eq!(umem.available() + held.len(), frame_count);

    for offset in held.drain(..) {
        umem.release(offset);
    }
    assert_eq!(umem.available(), frame_count);
}

#[test]
fn released_offsets_are_immediately_reservable_again() {
    let mut memory = PageAlignedMemory::alloc(4096, 4).unwrap();
    let umem = SliceUmem::new(&mut memory, 4096).unwrap();

    let frame = umem.reserve().unwrap();
    let offset = frame.offset();
    umem.release(offset);

    let reacquired = umem.reserve().unwrap();
    assert_eq!(reacquired.offset(), offset);
}
