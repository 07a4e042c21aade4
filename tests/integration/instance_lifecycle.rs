use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use ufo::{
    Instance, InstanceOptions, ObjectCallbacks, ObjectConfig, ObjectHandle, Result, UfoError,
};

const OPTIONS: &str = r#"
ring_capacity = 8
high_water_mark_bytes = 16777216
low_water_mark_bytes = 8388608
"#;

fn start_instance() -> Result<Option<Instance>> {
    let mut instance = Instance::new(InstanceOptions::from_toml_str(OPTIONS)?)?;
    match instance.start() {
        Ok(()) => Ok(Some(instance)),
        Err(err @ (UfoError::Unsupported(_) | UfoError::Io(_))) => {
            eprintln!("skipping: userfaultfd unavailable ({err})");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn counted(destroyed: &Arc<AtomicUsize>) -> ObjectCallbacks {
    let destroyed = Arc::clone(destroyed);
    ObjectCallbacks::new(|start, _, target| {
        target.fill(start as u8);
        Ok(())
    })
    .with_destructor(move || {
        destroyed.fetch_add(1, Ordering::SeqCst);
    })
}

fn touch(handle: &ObjectHandle) -> Result<u8> {
    let mut byte = [0u8; 1];
    handle.read_at(0, &mut byte)?;
    Ok(byte[0])
}

#[test]
fn destroy_leaves_other_objects_untouched() -> Result<()> {
    let Some(instance) = start_instance()? else {
        return Ok(());
    };
    let destroyed = Arc::new(AtomicUsize::new(0));
    let config = ObjectConfig::new(0, 100_000, 4, None)?;
    let a = instance.create_object(&config, counted(&destroyed))?;
    let b = instance.create_object(&config, counted(&destroyed))?;
    touch(&a)?;
    touch(&b)?;

    let a_addr = a.start();
    instance.destroy_object(&a)?;
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert!(!a.is_alive());
    assert!(matches!(touch(&a), Err(UfoError::Destroyed(id)) if id == a.id()));
    assert!(instance.lookup(a_addr).map_or(true, |h| h.id() != a.id()));
    assert_eq!(touch(&b)?, 0);

    // destroying twice is a no-op
    a.destroy()?;
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    let stats = instance.stats();
    assert_eq!((stats.objects_allocated, stats.objects_freed), (2, 1));
    instance.shutdown(true)
}

#[test]
fn shutdown_releases_live_objects() -> Result<()> {
    let Some(instance) = start_instance()? else {
        return Ok(());
    };
    let destroyed = Arc::new(AtomicUsize::new(0));
    let config = ObjectConfig::new(0, 1000, 8, None)?;
    let handle = instance.create_object(&config, counted(&destroyed))?;
    touch(&handle)?;

    instance.shutdown(true)?;
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert!(!handle.is_alive());
    assert!(matches!(touch(&handle), Err(UfoError::Destroyed(_))));
    // the instance is gone, so there is nothing left to free
    handle.destroy()
}

#[test]
fn requests_after_shutdown_are_refused() -> Result<()> {
    let Some(instance) = start_instance()? else {
        return Ok(());
    };
    instance.request_shutdown();
    let config = ObjectConfig::new(0, 10, 8, None)?;
    let err = instance
        .create_object(&config, ObjectCallbacks::new(|_, _, _| Ok(())))
        .unwrap_err();
    assert!(matches!(err, UfoError::ShuttingDown));
    instance.await_shutdown()
}

#[test]
fn lifecycle_misuse_is_reported() -> Result<()> {
    let Some(mut instance) = start_instance()? else {
        return Ok(());
    };
    assert!(instance.is_running());
    assert!(matches!(instance.start(), Err(UfoError::AlreadyStarted)));
    assert!(matches!(
        instance.set_memory_limits(1 << 30, 1 << 29),
        Err(UfoError::LimitsAlreadySet)
    ));
    assert_eq!(instance.options().ring_capacity, 8);
    instance.shutdown(false)
}

#[test]
fn concurrent_create_and_destroy() -> Result<()> {
    let Some(instance) = start_instance()? else {
        return Ok(());
    };
    let instance = Arc::new(instance);
    let destroyed = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let instance = Arc::clone(&instance);
            let destroyed = Arc::clone(&destroyed);
            thread::spawn(move || -> Result<()> {
                let config = ObjectConfig::new(0, 4096, 8, None)?;
                for _ in 0..10 {
                    let handle = instance.create_object(&config, counted(&destroyed))?;
                    assert!(instance.is_object_address(handle.start()));
                    touch(&handle)?;
                    handle.destroy()?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked")?;
    }
    assert_eq!(destroyed.load(Ordering::SeqCst), 80);
    let stats = instance.stats();
    assert_eq!((stats.objects_allocated, stats.objects_freed), (80, 80));

    match Arc::try_unwrap(instance) {
        Ok(instance) => instance.shutdown(true),
        Err(_) => panic!("instance still shared"),
    }
}

#[test]
fn dropping_an_instance_stops_its_worker() -> Result<()> {
    let Some(instance) = start_instance()? else {
        return Ok(());
    };
    let destroyed = Arc::new(AtomicUsize::new(0));
    let config = ObjectConfig::new(0, 1000, 8, None)?;
    let handle = instance.create_object(&config, counted(&destroyed))?;
    drop(instance);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert!(!handle.is_alive());
    Ok(())
}
