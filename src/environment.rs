//! Environmental management
//!
//! The environment is initialized once per rank with the transport that connects it to the other
//! ranks, and finalized when the returned `Universe` is dropped. In between, the world group is
//! available from `Universe::world()` or from `world()`.
//!
//! A rank is a thread (the local fabric runs one thread per rank), so the lifecycle state belongs
//! to the calling thread. Once finalized, a rank cannot be initialized again.
//!
//! # Unfinished features
//!
//! - Threading levels
//! - Buffers for buffered sends

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use log::{debug, error};

use crate::error::{Error, Result};
use crate::topology::Communicator;
use crate::transport::{RawComm, Transport, SUCCESS};

enum Lifecycle {
    Uninitialized,
    Active(Communicator),
    Finalized,
}

thread_local! {
    static LIFECYCLE: RefCell<Lifecycle> = RefCell::new(Lifecycle::Uninitialized);
}

/// Global context of an initialized rank
///
/// Dropping it finalizes the environment.
///
/// # Examples
///
/// See `demos/hello.rs`
pub struct Universe {
    world: Communicator,
}

impl Universe {
    /// The 'world communicator'
    ///
    /// Contains all ranks initially partaking in the computation.
    pub fn world(&self) -> Communicator {
        self.world.clone()
    }
}

impl fmt::Debug for Universe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Universe").field("world", &self.world).finish()
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        // The thread may already be tearing down its locals.
        let _ = LIFECYCLE.try_with(|cell| *cell.borrow_mut() = Lifecycle::Finalized);
        let code = self.world.transport().finalize();
        if code != SUCCESS {
            error!("finalizing the environment failed with code {}", code);
        } else {
            debug!("environment finalized");
        }
    }
}

/// Initialize the environment of the calling rank on `transport`.
///
/// Fails with `Error::AlreadyInitialized` while a `Universe` is alive, and with
/// `Error::Finalized` once one has been dropped.
///
/// # Examples
///
/// See `demos/hello.rs`
pub fn initialize(transport: Arc<dyn Transport>) -> Result<Universe> {
    LIFECYCLE.with(|cell| {
        let mut lifecycle = cell.borrow_mut();
        match *lifecycle {
            Lifecycle::Active(_) => return Err(Error::AlreadyInitialized),
            Lifecycle::Finalized => return Err(Error::Finalized),
            Lifecycle::Uninitialized => {}
        }
        let world = Communicator::from_raw(Arc::clone(&transport), RawComm::WORLD);
        world.check(transport.initialize())?;
        debug!("environment initialized on {:?}", transport);
        *lifecycle = Lifecycle::Active(world.clone());
        Ok(Universe { world })
    })
}

/// Whether the environment of the calling rank has been initialized
///
/// Stays true after finalization.
pub fn is_initialized() -> bool {
    LIFECYCLE.with(|cell| !matches!(*cell.borrow(), Lifecycle::Uninitialized))
}

/// Whether the environment of the calling rank has been finalized
pub fn is_finalized() -> bool {
    LIFECYCLE.with(|cell| matches!(*cell.borrow(), Lifecycle::Finalized))
}

/// The world group of the calling rank while its environment is active
pub fn world() -> Result<Communicator> {
    LIFECYCLE.with(|cell| match *cell.borrow() {
        Lifecycle::Active(ref world) => Ok(world.clone()),
        Lifecycle::Uninitialized => Err(Error::NotInitialized),
        Lifecycle::Finalized => Err(Error::Finalized),
    })
}

/// Time in seconds since an arbitrary time in the past.
///
/// The clock is the transport's and is shared by all ranks.
pub fn time() -> Result<f64> {
    world().map(|world| world.transport().wtime())
}
