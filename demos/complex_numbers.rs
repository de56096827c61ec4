#![deny(warnings)]
use mpi_typed::collective::SystemOperation;
use mpi_typed::transport::local;
use num_complex::Complex64;

fn main() {
    local::run(3, |universe| {
        let world = universe.world();

        let mut data = if world.rank().unwrap() == 0 {
            vec![
                Complex64::new(1.0, 2.0),
                Complex64::new(2.0, 3.0),
                Complex64::new(3.0, 4.0),
            ]
        } else {
            vec![Complex64::new(0.0, 0.0); 3]
        };

        world.broadcast_into(&mut data[..], 0).unwrap();
        assert_eq!(
            vec![
                Complex64::new(1.0, 2.0),
                Complex64::new(2.0, 3.0),
                Complex64::new(3.0, 4.0),
            ],
            data
        );

        let mut total = vec![Complex64::new(0.0, 0.0); 3];
        world
            .all_reduce_into(&data, &mut total, SystemOperation::sum())
            .unwrap();
        assert_eq!(total[2], Complex64::new(9.0, 12.0));
    })
    .unwrap();
}
