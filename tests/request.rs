use std::thread;
use std::time::Duration;

use mpi_typed::request::{self, Request, RequestState, TestAny};
use mpi_typed::traits::*;
use mpi_typed::transport::local;

#[test]
fn empty_requests_test_true() {
    let mut request = Request::null();
    assert!(request.test().unwrap());
    assert_eq!(request.state(), RequestState::Empty);
}

#[test]
fn dropped_send_leaves_the_receiver_intact() {
    local::run(2, |universe| {
        let world = universe.world();
        if world.rank().unwrap() == 0 {
            let data = [1u32, 2, 3];
            let _ = world.immediate_send(&data[..], 1, 0).unwrap();
        } else {
            let mut buf = [0u32; 3];
            world.receive_into(&mut buf[..], 0, 0).unwrap();
            assert_eq!(buf, [1, 2, 3]);
        }
    })
    .unwrap();
}

#[test]
fn immediate_receive_fills_its_buffer() {
    local::run(2, |universe| {
        let world = universe.world();
        if world.rank().unwrap() == 1 {
            let mut buf = [0.0f64; 4];
            let mut request = world.immediate_receive_into(&mut buf[..], 0, 2).unwrap();
            assert!(request.is_pending());
            let status = request.wait().unwrap();
            assert_eq!(request.state(), RequestState::Resolved);
            assert_eq!(status.source_rank(), 0);
            assert_eq!(status.count::<f64>(), 3);
            assert!(request.wait().unwrap().is_empty());
            drop(request);
            assert_eq!(buf, [1.0, 2.0, 3.0, 0.0]);
        } else {
            world.send(&[1.0f64, 2.0, 3.0][..], 1, 2).unwrap();
        }
    })
    .unwrap();
}

#[test]
fn test_polls_without_blocking() {
    local::run(1, |universe| {
        let world = universe.world();
        let mut value = 0i16;
        {
            let mut request = world.immediate_receive_into(&mut value, 0, 1).unwrap();
            assert!(!request.test().unwrap());
            assert!(request.test_with_status().unwrap().is_none());
            world.send(&-3i16, 0, 1).unwrap();
            let status = request.test_with_status().unwrap().unwrap();
            assert_eq!(status.tag(), 1);
            assert!(!request.is_pending());
        }
        assert_eq!(value, -3);
    })
    .unwrap();
}

#[test]
fn cancelled_requests_leave_messages_alone() {
    local::run(1, |universe| {
        let world = universe.world();
        let mut value = 0u8;

        let mut receive = world.immediate_receive_into(&mut value, 0, 3).unwrap();
        receive.cancel().unwrap();
        assert_eq!(receive.state(), RequestState::Resolved);
        drop(receive);
        world.send(&9u8, 0, 3).unwrap();
        assert_eq!(world.receive::<u8>(0, 3).unwrap().0, 9);

        let mut send = world.immediate_send(&5u8, 0, 4).unwrap();
        send.cancel().unwrap();
        assert!(send.wait().unwrap().is_empty());
        let mut unmatched = world.immediate_receive_into(&mut value, 0, 4).unwrap();
        assert!(!unmatched.test().unwrap());
        unmatched.cancel().unwrap();
    })
    .unwrap();
}

#[test]
fn waiting_on_collections() {
    local::run(1, |universe| {
        let world = universe.world();
        let (mut a, mut b, mut c) = (0i32, 0i32, 0i32);
        {
            let mut requests = vec![
                world.immediate_receive_into(&mut a, 0, 1).unwrap(),
                world.immediate_receive_into(&mut b, 0, 2).unwrap(),
                world.immediate_receive_into(&mut c, 0, 3).unwrap(),
            ];
            assert!(matches!(
                request::test_any(&mut requests).unwrap(),
                TestAny::NoneComplete
            ));

            world.send(&20, 0, 2).unwrap();
            let (index, status) = request::wait_any(&mut requests).unwrap().unwrap();
            assert_eq!(index, 1);
            assert_eq!(status.tag(), 2);

            world.send(&30, 0, 3).unwrap();
            world.send(&10, 0, 1).unwrap();
            let completed = request::wait_some(&mut requests).unwrap();
            let indices: Vec<usize> = completed.iter().map(|&(index, _)| index).collect();
            assert_eq!(indices, vec![0, 2]);

            assert!(request::wait_any(&mut requests).unwrap().is_none());
            let statuses = request::wait_all(&mut requests).unwrap();
            assert!(statuses.iter().all(|status| status.is_empty()));
        }
        assert_eq!((a, b, c), (10, 20, 30));

        let values = [1u64, 2, 3];
        let mut sends: Vec<Request> = values
            .iter()
            .map(|value| world.immediate_send(value, 0, 8).unwrap())
            .collect();
        let statuses = request::wait_all(&mut sends).unwrap();
        assert!(statuses.iter().all(|status| status.count::<u64>() == 1));
        for expected in values {
            assert_eq!(world.receive::<u64>(0, 8).unwrap().0, expected);
        }
    })
    .unwrap();
}

#[test]
fn wait_any_sleeps_until_a_peer_sends() {
    local::run(2, |universe| {
        let world = universe.world();
        if world.rank().unwrap() == 0 {
            thread::sleep(Duration::from_millis(50));
            world.send(&7u32, 1, 5).unwrap();
            world.send(&8u32, 1, 6).unwrap();
        } else {
            let (mut first, mut second) = (0u32, 0u32);
            {
                let mut requests = vec![
                    world.immediate_receive_into(&mut first, 0, 6).unwrap(),
                    world.immediate_receive_into(&mut second, 0, 5).unwrap(),
                ];
                let (index, status) = request::wait_any(&mut requests).unwrap().unwrap();
                assert_eq!((index, status.tag()), (1, 5));
                assert!(!requests[1].is_pending());

                let completed = request::wait_some(&mut requests).unwrap();
                assert_eq!(completed.len(), 1);
                assert_eq!(completed[0].0, 0);
                assert!(request::wait_some(&mut requests).unwrap().is_empty());
            }
            assert_eq!((first, second), (8, 7));
        }
    })
    .unwrap();
}
