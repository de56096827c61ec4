#![deny(warnings)]
use mpi_typed::collective::{self, SystemOperation, UserOperation};
use mpi_typed::datatype::ValueIndex;
use mpi_typed::transport::local;
use mpi_typed::Rank;

fn main() {
    local::run(5, |universe| {
        let world = universe.world();
        let rank = world.rank().unwrap();
        let size = world.size().unwrap();
        let root_rank = 0;

        let mut sum: Rank = 0;
        let recvbuf = if rank == root_rank {
            Some(std::slice::from_mut(&mut sum))
        } else {
            None
        };
        world
            .reduce_into(&[rank], recvbuf, SystemOperation::sum(), root_rank)
            .unwrap();
        if rank == root_rank {
            assert_eq!(sum, size * (size - 1) / 2);
        }

        let max = world.all_reduce(rank, SystemOperation::max()).unwrap();
        assert_eq!(max, size - 1);

        // The value with the lowest rank wins ties.
        let mine = ValueIndex::new((rank % 2) as f64, rank as i64);
        let lowest = world.all_reduce(mine, SystemOperation::min_loc()).unwrap();
        assert_eq!(lowest, ValueIndex::new(0.0, 0));

        let plus = UserOperation::commutative(&world, |a: &Rank, b: &Rank| a + b).unwrap();
        assert_eq!(world.all_reduce(rank, &plus).unwrap(), size * (size - 1) / 2);

        // Applied as r0 - (r1 - (r2 - ...)), so the order of the ranks shows.
        let minus = UserOperation::associative(&world, |a: &i64, b: &i64| a - b).unwrap();
        let alternating = world.reduce(rank as i64, &minus, root_rank).unwrap();
        if let Some(value) = alternating {
            println!("alternating sum over {} ranks: {}", size, value);
            assert_eq!(value, 2);
        }

        let a: u64 = 0b0000111111110000;
        let b: u64 = 0b0011110000111100;

        let mut c = [b];
        collective::reduce_local_into(&world, &[a], &mut c, SystemOperation::bitwise_and())
            .unwrap();
        assert_eq!(c[0], 0b0000110000110000);

        let mut d = [b];
        collective::reduce_local_into(&world, &[a], &mut d, SystemOperation::bitwise_or())
            .unwrap();
        assert_eq!(d[0], 0b0011111111111100);

        let mut e = [b];
        collective::reduce_local_into(&world, &[a], &mut e, SystemOperation::bitwise_xor())
            .unwrap();
        assert_eq!(e[0], 0b0011001111001100);
    })
    .unwrap();
}
