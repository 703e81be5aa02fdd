use kiln_mem::{RegionAllocator, SlotAllocator, SlotHandle, SlotLayout};
use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

const KIB: usize = 1024;

fn allocate_concurrently(alloc: &SlotAllocator, callers: usize) -> Vec<SlotHandle> {
    let barrier = Barrier::new(callers);
    thread::scope(|s| {
        let workers: Vec<_> = (0..callers)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    alloc.allocate().unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    })
}

#[test]
fn extra_caller_gets_os_fallback() {
    let layout = SlotLayout::new(0x5c10_0000_0000, 4, 16 * KIB, 16 * KIB, KIB).unwrap();
    let alloc = SlotAllocator::new(layout);

    let handles = allocate_concurrently(&alloc, 5);

    let fixed: Vec<_> = handles.iter().filter(|h| h.is_fixed()).collect();
    assert_eq!(fixed.len(), 4);
    let indices: HashSet<_> = fixed.iter().filter_map(|h| h.slot_index()).collect();
    assert_eq!(indices.len(), 4);
    for h in &fixed {
        assert_eq!(h.address(), layout.slot_address(h.slot_index().unwrap()));
    }
    let floating: Vec<_> = handles.iter().filter(|h| !h.is_fixed()).collect();
    assert_eq!(floating.len(), 1);
    assert!(!alloc.is_managing(floating[0].address()));

    drop(handles);
    assert_eq!(alloc.occupied_count(), 0);
}

#[test]
fn released_slots_are_reused() {
    let layout = SlotLayout::new(0x5c20_0000_0000, 2, 16 * KIB, 16 * KIB, KIB).unwrap();
    let alloc = SlotAllocator::new(layout);
    for _ in 0..3 {
        let handles = allocate_concurrently(&alloc, 2);
        assert!(handles.iter().all(SlotHandle::is_fixed));
    }
}

#[test]
fn regions_in_separate_slots_do_not_interfere() {
    let layout = SlotLayout::new(0x5c30_0000_0000, 2, 16 * KIB, 16 * KIB, KIB).unwrap();
    let alloc = SlotAllocator::new(layout);

    thread::scope(|s| {
        for byte in [0x11u8, 0x22] {
            let alloc = alloc.clone();
            s.spawn(move || {
                let mut region = RegionAllocator::new(alloc.allocate().unwrap()).unwrap();
                let body = region.begin_function("k").unwrap();
                region.write(body.addr, &[byte; 64]).unwrap();
                region.end_function("k", 64).unwrap();
                region.set_executable().unwrap();
                assert!(region.slot().as_slice()[..64].iter().all(|&b| b == byte));
            });
        }
    });
    assert_eq!(alloc.occupied_count(), 0);
}
