use std::sync::Arc;

use mpi_typed::environment;
use mpi_typed::traits::*;
use mpi_typed::transport::local::{self, FabricConfig};
use mpi_typed::Error;

#[test]
fn lifecycle_per_rank() {
    local::run(2, |universe| {
        assert!(environment::is_initialized());
        assert!(!environment::is_finalized());
        let world = environment::world().unwrap();
        assert_eq!(world.rank().unwrap(), universe.world().rank().unwrap());
        assert!(environment::time().unwrap() >= 0.0);
        assert!(matches!(
            environment::initialize(Arc::clone(world.transport())),
            Err(Error::AlreadyInitialized)
        ));

        drop(universe);
        assert!(environment::is_finalized());
        assert!(matches!(environment::world(), Err(Error::Finalized)));
        assert!(matches!(environment::time(), Err(Error::Finalized)));
    })
    .unwrap();

    assert!(!environment::is_initialized());
    assert!(matches!(environment::world(), Err(Error::NotInitialized)));
}

#[test]
fn ranks_run_on_named_threads() {
    let names = FabricConfig::new(3)
        .thread_name_prefix("worker")
        .run(|_| std::thread::current().name().map(str::to_owned))
        .unwrap();
    assert_eq!(
        names,
        vec![
            Some("worker-0".to_owned()),
            Some("worker-1".to_owned()),
            Some("worker-2".to_owned())
        ]
    );
}

#[cfg(not(any(feature = "abort-on-error", feature = "ignore-errors")))]
#[test]
fn a_panicking_rank_releases_its_peers() {
    let outcome = std::panic::catch_unwind(|| {
        local::run(2, |universe| {
            let world = universe.world();
            if world.rank().unwrap() == 1 {
                panic!("rank 1 gives up");
            }
            world.receive::<i32>(1, 0).is_err()
        })
    });
    let payload = outcome.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"rank 1 gives up"));
}
