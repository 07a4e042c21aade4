use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;
use ufo::{
    Instance, InstanceOptions, ObjectCallbacks, ObjectConfig, PopulateError, Result, StatsSnapshot,
    UfoError,
};

type Calls = Arc<Mutex<Vec<(u64, u64)>>>;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ufo=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Starts an instance, or returns `None` where userfaultfd is unavailable.
fn start_instance(high: usize, low: usize) -> Result<Option<Instance>> {
    init_tracing();
    let mut instance = Instance::new(InstanceOptions::default())?;
    instance.set_memory_limits(high, low)?;
    match instance.start() {
        Ok(()) => Ok(Some(instance)),
        Err(UfoError::Unsupported(why)) => {
            eprintln!("skipping: userfaultfd unavailable ({why})");
            Ok(None)
        }
        Err(UfoError::Io(err)) => {
            eprintln!("skipping: userfaultfd unavailable ({err})");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Element `i` is `i * 3` as a little-endian u64.
fn triples(calls: &Calls) -> ObjectCallbacks {
    let calls = Arc::clone(calls);
    ObjectCallbacks::new(move |start, end, target| {
        calls.lock().push((start, end));
        for (i, slot) in (start..end).zip(target.chunks_mut(8)) {
            slot.copy_from_slice(&(i * 3).to_le_bytes());
        }
        Ok(())
    })
}

/// The worker records an install after waking the faulting thread, so
/// counters can trail a read that just returned.
fn settled_stats(instance: &Instance, done: impl Fn(&StatsSnapshot) -> bool) -> StatsSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = instance.stats();
        if done(&stats) || Instant::now() >= deadline {
            return stats;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn element(handle: &ufo::ObjectHandle, index: usize) -> Result<u64> {
    let mut bytes = [0u8; 8];
    handle.read_at(index * 8, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

#[test]
fn head_and_tail_reads_populate_two_disjoint_chunks() -> Result<()> {
    let Some(instance) = start_instance(64 << 20, 32 << 20)? else {
        return Ok(());
    };
    let calls = Calls::default();
    let config = ObjectConfig::new(0, 1_000_000, 8, Some(100))?;
    let handle = instance.create_object(&config, triples(&calls))?;

    assert_eq!(element(&handle, 0)?, 0);
    assert_eq!(element(&handle, 999_999)?, 999_999 * 3);

    let calls = calls.lock().clone();
    assert_eq!(calls.len(), 2, "populate calls: {calls:?}");
    let (head, tail) = (calls[0], calls[1]);
    assert_eq!(head.0, 0);
    assert!(head.1 - head.0 >= 100);
    assert!(head.1 <= tail.0, "chunks overlap: {head:?} {tail:?}");
    assert!(tail.0 <= 999_999 && tail.1 == 1_000_000);
    let stats = settled_stats(&instance, |s| s.chunks_installed >= 2);
    assert_eq!(stats.chunks_installed, 2);

    handle.destroy()?;
    instance.shutdown(true)
}

#[test]
fn repeated_reads_do_not_fault_again() -> Result<()> {
    let Some(instance) = start_instance(64 << 20, 32 << 20)? else {
        return Ok(());
    };
    let calls = Calls::default();
    let config = ObjectConfig::new(0, 10_000, 8, Some(1))?;
    let handle = instance.create_object(&config, triples(&calls))?;
    for _ in 0..3 {
        assert_eq!(element(&handle, 17)?, 51);
    }
    assert_eq!(calls.lock().len(), 1);
    instance.shutdown(true)
}

#[test]
fn header_is_zeroed_writable_and_never_populated() -> Result<()> {
    let Some(instance) = start_instance(16 << 20, 8 << 20)? else {
        return Ok(());
    };
    let calls = Calls::default();
    let config = ObjectConfig::new(24, 1000, 8, None)?;
    let handle = instance.create_object(&config, triples(&calls))?;

    let mut header = [0xFFu8; 24];
    handle.read_header(0, &mut header)?;
    assert_eq!(header, [0u8; 24]);
    handle.write_header(8, b"lazy!")?;
    let mut back = [0u8; 5];
    handle.read_header(8, &mut back)?;
    assert_eq!(&back, b"lazy!");
    assert_eq!(handle.body_ptr() as usize - handle.header_ptr() as usize, 24);
    assert!(calls.lock().is_empty());
    instance.shutdown(true)
}

#[test]
fn lookup_maps_addresses_to_objects() -> Result<()> {
    let Some(instance) = start_instance(16 << 20, 8 << 20)? else {
        return Ok(());
    };
    let config = ObjectConfig::new(0, 4096, 8, None)?;
    let a = instance.create_object(&config, triples(&Calls::default()))?;
    let b = instance.create_object(&config, triples(&Calls::default()))?;

    let found = instance.lookup(a.body_ptr() as usize + 100).expect("a is registered");
    assert_eq!(found.id(), a.id());
    assert_eq!(
        instance.lookup(b.start() + b.true_size() - 1).map(|h| h.id()),
        Some(b.id())
    );
    assert!(instance.is_object_address(a.start()));
    assert!(!instance.is_object_address(0x10));
    assert_ne!(a.id(), b.id());
    instance.shutdown(true)
}

#[test]
fn concurrent_readers_share_one_object() -> Result<()> {
    let Some(instance) = start_instance(64 << 20, 32 << 20)? else {
        return Ok(());
    };
    let calls = Calls::default();
    let config = ObjectConfig::new(0, 500_000, 8, Some(1024))?;
    let handle = instance.create_object(&config, triples(&calls))?;

    let readers: Vec<_> = (0..4u64)
        .map(|seed| {
            let handle = handle.clone();
            thread::spawn(move || -> Result<()> {
                let mut index = seed * 7919;
                for _ in 0..2_000 {
                    index = index
                        .wrapping_mul(6_364_136_223_846_793_005)
                        .wrapping_add(1_442_695_040_888_963_407)
                        % 500_000;
                    assert_eq!(element(&handle, index as usize)?, index * 3);
                }
                Ok(())
            })
        })
        .collect();
    for reader in readers {
        reader.join().expect("reader panicked")?;
    }
    // racing faults may populate a chunk twice but install it once
    let mut ranges = calls.lock().clone();
    ranges.sort_unstable();
    ranges.dedup();
    let expected = ranges.len() as u64;
    let stats = settled_stats(&instance, |s| s.chunks_installed >= expected);
    assert_eq!(stats.chunks_installed, expected);
    instance.shutdown(true)
}

#[test]
fn writable_objects_accept_writes() -> Result<()> {
    let Some(instance) = start_instance(16 << 20, 8 << 20)? else {
        return Ok(());
    };
    let config = ObjectConfig::new(0, 10_000, 8, None)?.writable(true);
    let handle = instance.create_object(&config, triples(&Calls::default()))?;
    handle.write_at(40 * 8, &7u64.to_le_bytes())?;
    assert_eq!(element(&handle, 40)?, 7);
    assert_eq!(element(&handle, 41)?, 123);

    let read_only =
        instance.create_object(&ObjectConfig::new(0, 10, 8, None)?, triples(&Calls::default()))?;
    assert!(matches!(
        read_only.write_at(0, &[1]),
        Err(UfoError::ReadOnly(id)) if id == read_only.id()
    ));
    instance.shutdown(true)
}

#[test]
fn populate_failure_reaches_the_reader_as_an_error() -> Result<()> {
    let Some(instance) = start_instance(16 << 20, 8 << 20)? else {
        return Ok(());
    };
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&destroyed);
    let callbacks = ObjectCallbacks::new(|_, _, _| Err(PopulateError::new("offline")))
        .with_destructor(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let handle = instance.create_object(&ObjectConfig::new(0, 4096, 8, None)?, callbacks)?;

    let mut buf = [0u8; 8];
    assert!(matches!(handle.read_at(0, &mut buf), Err(UfoError::ShuttingDown)));

    let err = instance.await_shutdown().unwrap_err();
    assert!(matches!(err, UfoError::Populate(_)), "{err}");
    assert!(!handle.is_alive());
    assert!(matches!(handle.read_at(0, &mut buf), Err(UfoError::Destroyed(_))));
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    handle.destroy()
}
