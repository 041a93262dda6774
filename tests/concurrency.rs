use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use idreg::{ClassSpec, ErrorKind, Hid, ObjectPtr, Registry, RegistryConfig};

const THREADS: usize = 4;
const OPS_PER_THREAD: usize = 4_000;

/// xorshift64*, enough to scatter operations without a dependency.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn next(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

#[derive(Default)]
struct Tally {
    registered: AtomicU64,
    removed: AtomicU64,
    released: AtomicU64,
}

#[test]
fn test_concurrent_operations_balance() {
    let reg = Registry::new(RegistryConfig { max_desired_rec_fl_len: 64, ..Default::default() }).unwrap();
    let frees = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&frees);
    let c = reg
        .register_class(ClassSpec::new().free_fn(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })))
        .unwrap();

    let tally = Tally::default();
    let published: Mutex<Vec<Hid>> = Mutex::new(Vec::new());
    let barrier = Barrier::new(THREADS);

    let survivors: Vec<Hid> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let (reg, tally, published, barrier) = (&reg, &tally, &published, &barrier);
                s.spawn(move || {
                    let mut rng = Rng::new(t as u64 + 1);
                    let mut mine: Vec<Hid> = Vec::new();
                    barrier.wait();

                    for i in 0..OPS_PER_THREAD {
                        let op = rng.below(6);
                        if mine.is_empty() || op == 0 {
                            let h = reg.register(c, ObjectPtr::from_addr(t * 1_000_000 + i + 1), true).unwrap();
                            tally.registered.fetch_add(1, Ordering::Relaxed);
                            published.lock().unwrap().push(h);
                            mine.push(h);
                            continue;
                        }
                        let at = rng.below(mine.len());
                        let h = mine[at];
                        let outcome = match op {
                            1 => reg.inc_ref(h, false).map(drop),
                            2 => match reg.dec_ref(h, false) {
                                Ok(0) => {
                                    tally.released.fetch_add(1, Ordering::Relaxed);
                                    mine.swap_remove(at);
                                    continue;
                                }
                                other => other.map(drop),
                            },
                            3 => match reg.remove(h, c) {
                                Ok(_) => {
                                    tally.removed.fetch_add(1, Ordering::Relaxed);
                                    mine.swap_remove(at);
                                    continue;
                                }
                                Err(err) => Err(err),
                            },
                            4 => reg.lookup(h, c).map(drop),
                            _ => {
                                // Touch a handle owned by some other thread.
                                let other = {
                                    let all = published.lock().unwrap();
                                    all[rng.below(all.len())]
                                };
                                if reg.inc_ref(other, false).is_ok() {
                                    match reg.dec_ref(other, false) {
                                        Ok(0) => {
                                            tally.released.fetch_add(1, Ordering::Relaxed);
                                        }
                                        Ok(_) => {}
                                        Err(err) => assert_eq!(err.kind(), ErrorKind::NoSuchId),
                                    }
                                }
                                Ok(())
                            }
                        };
                        if let Err(err) = outcome {
                            // Only another thread's release can take our handle away.
                            assert_eq!(err.kind(), ErrorKind::NoSuchId);
                            mine.swap_remove(at);
                        }
                    }
                    mine
                })
            })
            .collect();
        workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
    });

    let live = reg.class_members(c).unwrap();
    let registered = tally.registered.load(Ordering::Relaxed);
    let removed = tally.removed.load(Ordering::Relaxed);
    let released = tally.released.load(Ordering::Relaxed);
    assert_eq!(registered - removed - released, live);
    assert_eq!(frees.load(Ordering::Relaxed) as u64, released);

    let still_referenced = survivors.iter().filter(|&&h| reg.get_ref(h, false).is_ok()).count();
    assert_eq!(still_referenced as u64, live);

    let mut walked = 0u64;
    reg.iterate(
        c,
        |_, _| {
            walked += 1;
            0
        },
        false,
    )
    .unwrap();
    assert_eq!(walked, live);
}

#[test]
fn test_concurrent_class_registration() {
    let reg = Registry::new(RegistryConfig::default()).unwrap();
    let barrier = Barrier::new(THREADS);

    let classes: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    (0..20).map(|_| reg.register_class(ClassSpec::new()).unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
    });

    let distinct: HashSet<_> = classes.iter().copied().collect();
    assert_eq!(distinct.len(), THREADS * 20);
    for &c in &classes {
        assert!(reg.has_class(c).unwrap());
        assert_eq!(reg.class_members(c).unwrap(), 0);
    }
}

#[test]
fn test_register_while_destroying() {
    for round in 0..20 {
        let reg = Registry::new(RegistryConfig::default()).unwrap();
        let frees = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&frees);
        let c = reg
            .register_class(ClassSpec::new().free_fn(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .unwrap();

        let accepted = thread::scope(|s| {
            let producer = s.spawn(|| {
                let mut accepted = 0usize;
                for i in 0..10_000usize {
                    match reg.register(c, ObjectPtr::from_addr(i + 1), true) {
                        Ok(_) => accepted += 1,
                        Err(err) => {
                            assert_eq!(err.kind(), ErrorKind::NoSuchClass);
                            break;
                        }
                    }
                }
                accepted
            });
            if round % 2 == 0 {
                thread::yield_now();
            }
            reg.destroy_class(c).unwrap();
            producer.join().unwrap()
        });

        // Every handle that made it into the table was freed by the teardown.
        assert_eq!(frees.load(Ordering::SeqCst), accepted);
        assert!(!reg.has_class(c).unwrap());
    }
}

#[test]
fn test_records_are_recycled_under_load() {
    let reg = Registry::new(RegistryConfig { max_desired_rec_fl_len: 8, ..Default::default() }).unwrap();
    let c = reg.register_class(ClassSpec::new()).unwrap();

    thread::scope(|s| {
        for t in 0..THREADS {
            let reg = &reg;
            s.spawn(move || {
                for i in 0..2_000usize {
                    let obj = ObjectPtr::from_addr(t * 1_000_000 + i + 1);
                    let h = reg.register(c, obj, false).unwrap();
                    assert_eq!(reg.lookup(h, c).unwrap(), obj);
                    assert_eq!(reg.dec_ref(h, false).unwrap(), 0);
                    assert_eq!(reg.lookup(h, c).unwrap_err().kind(), ErrorKind::NoSuchId);
                }
            });
        }
    });

    let stats = reg.stats();
    assert_eq!(reg.class_members(c).unwrap(), 0);
    assert_eq!(stats.register, (THREADS * 2_000) as u64);
    assert_eq!(stats.rec_heap_allocs + stats.rec_reuses, stats.register);
    assert!(stats.quiescent_epochs > 0);
}
