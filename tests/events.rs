use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use filament::coio::{self, CoStream};
use filament::error::Error;
use filament::fiber;
use filament::io::{CascadingEngine, Events, Interest};

mod common;
use common::run;

fn pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

#[test]
fn costream_read_suspends_until_data() {
    run(|| {
        let (a, b) = pair();
        let mut a = CoStream::new(a).unwrap();
        let mut b = CoStream::new(b).unwrap();

        let writer = fiber::defer_proc(move || {
            fiber::sleep_us(5_000);
            b.write_all(b"hello").unwrap();
        });

        let mut buf = [0u8; 8];
        let n = a.read_with_timeout(&mut buf, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(&buf[..n], b"hello");
        writer.join();
    });
}

#[test]
fn wait_for_fd_times_out() {
    run(|| {
        let (a, _b) = pair();
        let t0 = Instant::now();
        match coio::wait_for_fd_readable(a.as_raw_fd(), Some(Duration::from_millis(10))) {
            Err(Error::Timeout) => {}
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert!(t0.elapsed() >= Duration::from_millis(10));
    });
}

#[test]
fn wait_for_fd_interrupted() {
    run(|| {
        let (a, _b) = pair();
        let me = fiber::current();
        let h = fiber::defer_proc(move || {
            fiber::sleep_us(5_000);
            fiber::interrupt(&me, 33);
        });
        match coio::wait_for_fd_readable(a.as_raw_fd(), None) {
            Err(Error::Interrupted(33)) => {}
            other => panic!("expected an interrupt, got {:?}", other),
        }
        h.join();
    });
}

#[test]
fn second_waiter_on_same_direction_is_rejected() {
    run(|| {
        let (a, _b) = pair();
        let fd = a.as_raw_fd();
        let me = fiber::current();
        let h = fiber::defer_proc(move || {
            match coio::wait_for_fd_readable(fd, None) {
                Err(Error::Interrupted(1)) => {}
                other => panic!("unexpected wait result: {:?}", other),
            }
            fiber::wake(&me);
        });
        fiber::sleep_us(1_000); // the first waiter is parked now

        match coio::wait_for_fd_readable(fd, Some(Duration::from_millis(100))) {
            Err(Error::BadState(_)) => {}
            other => panic!("expected a duplicate-interest error, got {:?}", other),
        }

        fiber::interrupt(&h.handle(), 1);
        h.join();
    });
}

#[test]
fn full_duplex_waiters_coexist() {
    run(|| {
        let (a, b) = pair();
        let fd = a.as_raw_fd();

        // Reader parks on the same fd our writer-side wait uses.
        let h = fiber::defer_proc(move || {
            coio::wait_for_fd_readable(fd, Some(Duration::from_secs(5))).unwrap();
        });
        fiber::sleep_us(1_000);

        // A socket with empty send buffer is immediately writable.
        coio::wait_for_fd_writable(fd, Some(Duration::from_secs(5))).unwrap();

        let mut b = CoStream::new(b).unwrap();
        b.write_all(b"x").unwrap();
        h.join();
    });
}

#[test]
fn cascading_engine_batches_events() {
    run(|| {
        let engine = CascadingEngine::new().unwrap();
        let (a1, mut b1) = pair();
        let (a2, mut b2) = pair();

        engine
            .add_interest(Interest {
                fd: a1.as_raw_fd(),
                events: Events::READ,
                data: 101,
            })
            .unwrap();
        engine
            .add_interest(Interest {
                fd: a2.as_raw_fd(),
                events: Events::READ,
                data: 202,
            })
            .unwrap();

        b1.write_all(b"x").unwrap();
        b2.write_all(b"y").unwrap();

        let mut out = [0u64; 8];
        let n = engine
            .wait_for_events(&mut out, Some(Duration::from_secs(5)))
            .unwrap();
        let mut got = out[..n].to_vec();
        got.sort_unstable();
        assert_eq!(got, [101, 202]);
    });
}

#[test]
fn cascading_interests_are_persistent() {
    run(|| {
        let engine = CascadingEngine::new().unwrap();
        let (a, mut b) = pair();
        engine
            .add_interest(Interest {
                fd: a.as_raw_fd(),
                events: Events::READ,
                data: 7,
            })
            .unwrap();

        let mut out = [0u64; 4];
        for _ in 0..3 {
            b.write_all(b"x").unwrap();
            let n = engine
                .wait_for_events(&mut out, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(&out[..n], &[7]);
            // Consume the byte so the level-triggered interest settles.
            let mut sink = [0u8; 8];
            std::io::Read::read(&mut (&a), &mut sink).unwrap();
        }
    });
}

#[test]
fn cascading_one_shot_fires_once() {
    run(|| {
        let engine = CascadingEngine::new().unwrap();
        let (a, mut b) = pair();
        engine
            .add_interest(Interest {
                fd: a.as_raw_fd(),
                events: Events::READ | Events::ONE_SHOT,
                data: 7,
            })
            .unwrap();

        b.write_all(b"x").unwrap();
        let mut out = [0u64; 4];
        let n = engine
            .wait_for_events(&mut out, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(&out[..n], &[7]);

        // The interest is gone: nothing fires although data is pending.
        match engine.wait_for_events(&mut out, Some(Duration::from_millis(20))) {
            Err(Error::Timeout) => {}
            other => panic!("expected a timeout, got {:?}", other),
        }
    });
}

#[test]
fn cascading_rm_interest_stops_delivery() {
    run(|| {
        let engine = CascadingEngine::new().unwrap();
        let (a, mut b) = pair();
        let interest = Interest {
            fd: a.as_raw_fd(),
            events: Events::READ,
            data: 7,
        };
        engine.add_interest(interest).unwrap();
        engine.rm_interest(interest).unwrap();

        b.write_all(b"x").unwrap();
        let mut out = [0u64; 4];
        match engine.wait_for_events(&mut out, Some(Duration::from_millis(20))) {
            Err(Error::Timeout) => {}
            other => panic!("expected a timeout, got {:?}", other),
        }
    });
}
