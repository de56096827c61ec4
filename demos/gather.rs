#![deny(warnings)]
use mpi_typed::transport::local;

fn main() {
    local::run(4, |universe| {
        let world = universe.world();
        let root_rank = 0;
        let rank = world.rank().unwrap();
        let count = world.size().unwrap() as usize;

        let i = 2_u64.pow(rank as u32 + 1);
        if let Some(a) = world.gather(&i, root_rank).unwrap() {
            println!("Root gathered sequence: {:?}.", a);
            assert!(a.iter().enumerate().all(|(a, &b)| b == 2u64.pow(a as u32 + 1)));
        }

        let factor = rank as u64 + 1;
        let a = (1_u64..).take(count).map(|x| x * factor).collect::<Vec<_>>();
        let mut t = if rank == root_rank {
            Some(vec![0u64; count * count])
        } else {
            None
        };
        world
            .gather_into(&a, t.as_mut().map(|x| &mut x[..]), root_rank)
            .unwrap();

        if let Some(t) = t.as_ref() {
            println!("Root gathered table:");
            for r in t.chunks(count) {
                println!("{:?}", r);
            }
            assert!((0_u64..)
                .zip(t.iter())
                .all(|(a, &b)| b == (a / count as u64 + 1) * (a % count as u64 + 1)));
        }

        // Hand the table back out row by row.
        let mut row = vec![0u64; count];
        world
            .scatter_into(t.as_deref(), &mut row, root_rank)
            .unwrap();
        assert_eq!(row, a);

        let mut table = Vec::new();
        if rank == root_rank {
            table = t.unwrap_or_default();
        }
        world.broadcast_sequence(&mut table, root_rank).unwrap();
        assert_eq!(table.len(), count * count);
    })
    .unwrap();
}
