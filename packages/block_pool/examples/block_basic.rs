//! Basic usage example for `BlockPool`.
//!
//! This example walks through allocation, sharing, release and failure handling while printing
//! the allocator's log output, which shows every slot transition.

use block_pool::{AllocatorExt, BlockPool, Handle, PoolConfig, SharedPool, TypeTag};
use new_zealand::nz;
use tracing::Level;

const POINT: TypeTag = TypeTag::new(1);

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::TRACE).init();

    // A pool of four 8-byte slots. All storage is reserved here.
    let mut pool = BlockPool::builder()
        .capacity(nz!(4))
        .slot_size(nz!(8))
        .build()
        .unwrap();

    println!(
        "Created pool {} with {} slots of {} bytes",
        pool.pool_id(),
        pool.capacity(),
        pool.slot_size()
    );

    let point = pool.allocate(8, POINT).unwrap();
    pool.write_value(&point, &[3_i32, 4]).unwrap();

    // Sharing the slot requires an explicit new reference.
    let shared_point = pool.add_reference(&point).unwrap();
    println!("Slot info: {:?}", pool.query(&point).unwrap());

    pool.release(point).unwrap();

    let [x, y] = pool.read_value::<[i32; 2]>(&shared_point).unwrap();
    println!("Point survives the first release: ({x}, {y})");

    // Keep the identity around to demonstrate double release detection.
    let duplicate = Handle::from_raw(shared_point.raw());
    pool.release(shared_point).unwrap();

    match pool.release(duplicate) {
        Ok(_) => println!("Unexpectedly released the slot twice"),
        Err(error) => println!("Double release rejected: {error}"),
    }

    // Fill the pool to see exhaustion reported as a recoverable error.
    let handles: Vec<_> = (0..pool.capacity())
        .map(|_| pool.allocate(1, TypeTag::UNTYPED).unwrap())
        .collect();

    if let Err(error) = pool.allocate(1, TypeTag::UNTYPED) {
        println!("Allocation in a full pool failed: {error}");
    }

    for handle in handles {
        pool.release(handle).unwrap();
    }

    // With a shared pool, references release themselves when dropped.
    let shared_pool =
        SharedPool::new(BlockPool::from_config(PoolConfig::for_type::<u64>(2)).unwrap());

    {
        let value = shared_pool.allocate_value(&42_u64, TypeTag::new(2)).unwrap();
        let _another = value.clone();
        println!("Shared pool holds {} slot(s)", shared_pool.len());
    }

    println!("Shared pool holds {} slot(s) after scope exit", shared_pool.len());
}
