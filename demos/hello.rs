#![deny(warnings)]
use mpi_typed::logger::{self, LogLevel};
use mpi_typed::transport::local;

fn main() {
    local::run(4, |universe| {
        let world = universe.world();
        logger::init_from_env(&world, "MPI_TYPED_LOG", LogLevel::Info).unwrap();
        let rank = world.rank().unwrap();
        let size = world.size().unwrap();

        match rank {
            0 => {
                world.send_text("Hello", 1, 0).unwrap();
                let greeting = format!("Hello from the root of {} ranks", size);
                for dest in 1..size {
                    world.send_text(&greeting, dest, 1).unwrap();
                }
            }
            _ => {
                if rank == 1 {
                    let (msg, status) = world.receive_text(0, 0).unwrap();
                    log::info!("got {:?} with {:?}", msg, status);
                    assert_eq!(msg, "Hello");
                    assert_eq!(status.source_rank(), 0);
                    assert_eq!(status.tag(), 0);
                }
                let (msg, status) = world.receive_text(0, 1).unwrap();
                logger::check_status(&world, &status);
                log::info!("{}", msg);
            }
        }
        world.barrier().unwrap();
    })
    .unwrap();
}
