#![deny(warnings)]
#![allow(clippy::float_cmp)]
use mpi_typed::point_to_point::{ANY_SOURCE, ANY_TAG};
use mpi_typed::request::{self, Request};
use mpi_typed::transport::local;

fn main() {
    local::run(1, |universe| {
        let world = universe.world();

        let x = std::f32::consts::PI;
        let mut y: f32 = 0.0;

        {
            let mut sreq = world.immediate_send(&x, 0, 0).unwrap();
            let mut rreq = world.immediate_receive_into(&mut y, ANY_SOURCE, ANY_TAG).unwrap();
            rreq.wait().unwrap();
            while !sreq.test().unwrap() {}
        }
        assert_eq!(x, y);

        y = 0.0;
        {
            // Dropping a pending request waits for it.
            let _rreq = world.immediate_receive_into(&mut y, ANY_SOURCE, 7).unwrap();
            world.send(&x, 0, 7).unwrap();
        }
        assert_eq!(x, y);

        let values = [1.0f32, 2.0, 3.0];
        let mut received = [0.0f32; 3];
        {
            let mut requests: Vec<Request> = Vec::new();
            for (tag, value) in values.iter().enumerate() {
                requests.push(world.immediate_send(value, 0, tag as i32).unwrap());
            }
            for (tag, slot) in received.iter_mut().enumerate() {
                requests.push(world.immediate_receive_into(slot, 0, tag as i32).unwrap());
            }
            while let Some((index, status)) = request::wait_any(&mut requests).unwrap() {
                println!("request {} finished with {:?}", index, status);
            }
        }
        assert_eq!(values, received);

        let mut sreq = world.immediate_send(&x, 0, 9).unwrap();
        sreq.cancel().unwrap();
        assert!(sreq.wait().unwrap().is_empty());

        let mut rreq = world.immediate_receive_into(&mut y, 0, 10).unwrap();
        rreq.cancel().unwrap();
    })
    .unwrap();
}
