// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end runtime scenarios: a request/reply service spanning two
//! scheduler instances and a worker pool, a group-driven multiplexer,
//! and early exit through a deep call stack.

use std::sync::Arc;

use weft::{Chan, ChanGroup, Direction, Message, WorkerPool};

const CLIENTS_LOCAL: u64 = 3;
const CLIENTS_REMOTE: u64 = 2;

fn send_request(requests: &Chan, n: u64) -> u64 {
    let reply = Chan::new(1);
    reply.set_mark(n).expect("fresh reply channel");
    requests.send_chan(&reply).expect("send request");
    let v: u64 = reply
        .receive()
        .expect("reply arrives")
        .downcast()
        .expect("reply is a number");
    reply.release().expect("own reply reference");
    v
}

#[test]
fn request_reply_pipeline_across_instances() {
    weft::run(|| {
        let requests = Chan::new(4);
        let total = CLIENTS_LOCAL + CLIENTS_REMOTE;

        // Dispatcher: pull requests, square the tag on a kernel worker,
        // answer on the reply channel each request carries.
        let dispatcher_in = requests.clone();
        let dispatcher = weft::spawn(move || {
            let pool = WorkerPool::new(2, 2).expect("failed to start worker pool");
            for _ in 0..total {
                let reply = dispatcher_in.receive_chan().expect("request");
                let n = reply.mark().expect("request tag");
                let squared = pool.call(move || Message::data(n * n)).expect("bridge call");
                reply.send(squared).expect("deliver reply");
                reply.release().expect("received reply reference");
            }
        })
        .unwrap();

        let mut clients = Vec::new();
        for n in 1..=CLIENTS_LOCAL {
            let requests = requests.clone();
            clients.push(weft::spawn(move || send_request(&requests, n)).unwrap());
        }

        // More clients on a second instance; only channels connect it.
        let remote_requests = requests.clone();
        let remote = weft::spawn_scheduler(move || {
            for n in 10..10 + CLIENTS_REMOTE {
                let requests = remote_requests.clone();
                weft::spawn(move || {
                    let v = send_request(&requests, n);
                    assert_eq!(v, n * n);
                })
                .unwrap()
                .detach();
            }
        })
        .unwrap();

        let squares: Vec<u64> = clients.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(squares, [1, 4, 9]);
        dispatcher.join().expect("dispatcher finishes cleanly");
        remote.join().expect("remote instance drains");
    });
}

#[test]
fn group_multiplexes_two_producers() {
    weft::run(|| {
        let c1 = Chan::new(2);
        let c2 = Chan::new(2);
        for (chan, base) in [(&c1, 100u32), (&c2, 200u32)] {
            let chan = chan.clone();
            weft::spawn(move || {
                for i in 0..3 {
                    chan.send(Message::data(base + i)).unwrap();
                    weft::yield_now();
                }
            })
            .unwrap()
            .detach();
        }

        let group = ChanGroup::new();
        group.add(&c1, Direction::Receive).unwrap();
        group.add(&c2, Direction::Receive).unwrap();

        let mut from_c1 = Vec::new();
        let mut from_c2 = Vec::new();
        for _ in 0..6 {
            let (ready, dir) = group.wait().expect("some member becomes ready");
            assert_eq!(dir, Direction::Receive);
            let v: u32 = ready.receive().unwrap().downcast().unwrap();
            if ready == c1 {
                from_c1.push(v);
            } else {
                assert_eq!(ready, c2, "winner is always a member");
                from_c2.push(v);
            }
        }
        // per-producer order survives the multiplexing
        assert_eq!(from_c1, [100, 101, 102]);
        assert_eq!(from_c2, [200, 201, 202]);
    });
}

#[test]
fn exit_short_circuits_deep_call_stacks() {
    fn descend(depth: u32) -> u32 {
        if depth == 0 {
            weft::exit(77u32);
        }
        descend(depth - 1)
    }

    let v = weft::run(|| {
        let h = weft::spawn(|| descend(5)).unwrap();
        h.join().unwrap()
    });
    assert_eq!(v, 77);
}

#[test]
fn pool_results_reach_strands_on_other_instances() {
    let out = Chan::new(0);
    let out2 = out.clone();
    let driver = weft::spawn_scheduler(move || {
        let pool = Arc::new(WorkerPool::new(2, 1).unwrap());
        let mut handles = Vec::new();
        for i in 1..=4u64 {
            let pool = pool.clone();
            handles.push(
                weft::spawn(move || {
                    let v: u64 = pool
                        .call(move || Message::data(i * 100))
                        .unwrap()
                        .downcast()
                        .unwrap();
                    v
                })
                .unwrap(),
            );
        }
        let sum: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        out2.send(Message::data(sum)).unwrap();
    })
    .unwrap();

    // The main thread is not a runtime, but rendezvous receive pairs
    // with the parked sender without blocking machinery.
    let sum: u64 = loop {
        match out.try_receive() {
            Ok(msg) => break msg.downcast().unwrap(),
            Err(_) => std::thread::yield_now(),
        }
    };
    assert_eq!(sum, 100 + 200 + 300 + 400);
    driver.join().unwrap();
}
