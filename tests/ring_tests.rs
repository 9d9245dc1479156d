use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tickflow::{MpscRing, SpscRing};

#[test]
fn spsc_pop_sequence_is_prefix_of_push_sequence() {
    let ring = SpscRing::new(16);
    let mut pushed = Vec::new();
    let mut popped = Vec::new();

    for round in 0..200u64 {
        if ring.push(round).is_ok() {
            pushed.push(round);
        }
        if round % 3 == 0 {
            if let Some(value) = ring.pop() {
                popped.push(value);
            }
        }
    }
    while let Some(value) = ring.pop() {
        popped.push(value);
    }

    assert_eq!(popped, pushed[..popped.len()]);
    assert_eq!(popped.len(), pushed.len());
}

#[test]
fn spsc_capacity_boundary() {
    let ring = SpscRing::new(8);
    // N slots give N - 1 usable entries.
    for i in 0..7u32 {
        assert!(ring.push(i).is_ok());
    }
    assert!(ring.is_full());
    assert_eq!(ring.push(7), Err(7));

    // One pop frees exactly one slot.
    assert_eq!(ring.pop(), Some(0));
    assert!(ring.push(7).is_ok());
    assert!(ring.push(8).is_err());
}

#[test]
fn spsc_million_values_cross_thread_in_order() {
    const COUNT: u64 = 1_000_000;
    let ring = Arc::new(SpscRing::new(65_536));

    let producer_ring = ring.clone();
    let producer = thread::spawn(move || {
        for value in 0..COUNT {
            producer_ring.push_spin(value);
        }
    });

    let consumer_ring = ring.clone();
    let consumer = thread::spawn(move || {
        let mut expected = 0u64;
        while expected < COUNT {
            if let Some(value) = consumer_ring.pop() {
                assert_eq!(value, expected, "values must arrive exactly once, in order");
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        expected
    });

    producer.join().unwrap();
    assert_eq!(consumer.join().unwrap(), COUNT);
    assert!(ring.is_empty());
}

#[test]
fn spsc_batch_round_trip() {
    let ring = SpscRing::new(16);
    let input: Vec<u32> = (0..10).collect();
    assert_eq!(ring.push_batch(&input), 10);

    let mut out = [0u32; 4];
    assert_eq!(ring.pop_batch(&mut out), 4);
    assert_eq!(out, [0, 1, 2, 3]);
    let mut rest = [0u32; 16];
    assert_eq!(ring.pop_batch(&mut rest), 6);
    assert_eq!(&rest[..6], &[4, 5, 6, 7, 8, 9]);
}

#[test]
fn mpsc_exactly_once_under_producer_interleaving() {
    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 20_000;
    let ring = Arc::new(MpscRing::new(512));

    let mut producers = Vec::new();
    for producer_id in 0..PRODUCERS {
        let ring = ring.clone();
        producers.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                let mut value = producer_id * PER_PRODUCER + i;
                loop {
                    match ring.push(value) {
                        Ok(()) => break,
                        Err(returned) => {
                            value = returned;
                            std::hint::spin_loop();
                        }
                    }
                }
            }
        }));
    }

    let total = (PRODUCERS * PER_PRODUCER) as usize;
    let mut seen = HashSet::with_capacity(total);
    let mut last_by_producer = vec![None::<u64>; PRODUCERS as usize];
    while seen.len() < total {
        if let Some(value) = ring.pop() {
            assert!(seen.insert(value), "value {} observed twice", value);
            let producer = (value / PER_PRODUCER) as usize;
            if let Some(previous) = last_by_producer[producer] {
                assert!(
                    value > previous,
                    "observation order must linearize each producer's pushes"
                );
            }
            last_by_producer[producer] = Some(value);
        } else {
            std::hint::spin_loop();
        }
    }

    for producer in producers {
        producer.join().unwrap();
    }
    assert!(ring.is_empty());
}

#[test]
fn mpsc_full_and_empty_are_nonfatal() {
    let ring = MpscRing::new(4);
    assert_eq!(ring.pop(), None::<u64>);
    for i in 0..4u64 {
        assert!(ring.push(i).is_ok());
    }
    assert_eq!(ring.push(99), Err(99));
    assert_eq!(ring.pop(), Some(0));
    assert!(ring.push(99).is_ok());
}
