use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use ufo::primitives::paging::page_size;
use ufo::{Instance, InstanceOptions, ObjectCallbacks, ObjectConfig, Result, UfoError};

fn start_instance(options: InstanceOptions) -> Result<Option<Instance>> {
    let mut instance = Instance::new(options)?;
    match instance.start() {
        Ok(()) => Ok(Some(instance)),
        Err(err @ (UfoError::Unsupported(_) | UfoError::Io(_))) => {
            eprintln!("skipping: userfaultfd unavailable ({err})");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn budget(high_pages: usize, low_pages: usize) -> InstanceOptions {
    InstanceOptions {
        high_water_mark_bytes: Some(high_pages * page_size()),
        low_water_mark_bytes: Some(low_pages * page_size()),
        ..InstanceOptions::default()
    }
}

/// One element per page; every byte of element `i` is `i + 1`.
fn page_elements(count: u64, writable: bool) -> Result<ObjectConfig> {
    Ok(ObjectConfig::new(0, count, page_size(), Some(1))?.writable(writable))
}

fn first_byte(handle: &ufo::ObjectHandle, index: usize) -> Result<u8> {
    let mut byte = [0u8; 1];
    handle.read_at(index * page_size(), &mut byte)?;
    Ok(byte[0])
}

#[test]
fn evicted_chunks_come_back_through_populate() -> Result<()> {
    let Some(instance) = start_instance(budget(4, 2))? else {
        return Ok(());
    };
    let populated = Arc::new(Mutex::new(HashMap::<u64, usize>::new()));
    let log = Arc::clone(&populated);
    let callbacks = ObjectCallbacks::new(move |start, end, target| {
        *log.lock().entry(start).or_default() += 1;
        target.fill(start as u8 + 1);
        assert_eq!(end, start + 1);
        Ok(())
    });
    let handle = instance.create_object(&page_elements(32, false)?, callbacks)?;

    for index in 0..8 {
        assert_eq!(first_byte(&handle, index)?, index as u8 + 1);
    }
    let stats = instance.stats();
    assert!(stats.chunks_evicted >= 4, "{stats}");
    assert!(stats.chunks_installed - stats.chunks_evicted <= 4);

    assert_eq!(first_byte(&handle, 0)?, 1);
    assert_eq!(populated.lock()[&0], 2);
    instance.shutdown(true)
}

#[test]
fn eviction_writes_back_modified_chunks() -> Result<()> {
    let Some(instance) = start_instance(budget(2, 1))? else {
        return Ok(());
    };
    // the backing store: populate reads it, write-back updates it
    let store = Arc::new(Mutex::new(vec![0u8; 8]));
    let reader = Arc::clone(&store);
    let writer = Arc::clone(&store);
    let callbacks = ObjectCallbacks::new(move |start, _end, target| {
        target.fill(reader.lock()[start as usize]);
        Ok(())
    })
    .with_write_back(move |start, _end, bytes| {
        writer.lock()[start as usize] = bytes[0];
    });
    let handle = instance.create_object(&page_elements(8, true)?, callbacks)?;

    handle.write_at(0, &[0xAB])?;
    first_byte(&handle, 1)?;
    first_byte(&handle, 2)?;
    assert_eq!(store.lock()[0], 0xAB);
    assert_eq!(first_byte(&handle, 0)?, 0xAB);
    assert!(instance.stats().write_backs >= 1);

    handle.write_at(3 * page_size(), &[0x5A])?;
    handle.destroy()?;
    assert_eq!(store.lock()[3], 0x5A);
    instance.shutdown(true)
}

#[test]
fn oversized_chunks_are_refused_at_creation() -> Result<()> {
    let Some(instance) = start_instance(budget(2, 1))? else {
        return Ok(());
    };
    let config = ObjectConfig::new(0, 64, page_size(), Some(4))?;
    let err = instance
        .create_object(&config, ObjectCallbacks::new(|_, _, _| Ok(())))
        .unwrap_err();
    assert!(matches!(err, UfoError::ChunkTooLarge { chunk, .. } if chunk == 4 * page_size()));

    // the instance keeps serving well-sized objects
    let handle = instance.create_object(
        &page_elements(4, false)?,
        ObjectCallbacks::new(|start, _, target| {
            target.fill(start as u8 + 1);
            Ok(())
        }),
    )?;
    assert_eq!(first_byte(&handle, 3)?, 4);
    instance.shutdown(true)
}
