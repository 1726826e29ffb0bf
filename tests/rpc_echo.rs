use std::io::{Read as _, Write as _};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use filament::coio::CoStream;
use filament::error::Error;
use filament::fiber;
use filament::rpc::{FunctionId, Skeleton, Stub};

mod common;
use common::run;

const ECHO: FunctionId = FunctionId::new(9527, 1);
const SLOW_ECHO: FunctionId = FunctionId::new(9527, 2);

fn echo_server() -> (Rc<Skeleton>, fiber::UnitJoinHandle<'static>, CoStream) {
    let (client_end, server_end) = UnixStream::pair().unwrap();
    let skeleton = Skeleton::new(true);
    skeleton
        .add_function(ECHO, |_header, body| body.to_vec())
        .unwrap();
    skeleton
        .add_function(SLOW_ECHO, |_header, body| {
            fiber::sleep_us(50_000);
            body.to_vec()
        })
        .unwrap();

    let serve_skeleton = skeleton.clone();
    let server = fiber::Builder::new()
        .name("rpc-server")
        .proc(move || {
            let stream = CoStream::new(server_end).unwrap();
            let _ = serve_skeleton.serve(stream);
        })
        .defer()
        .unwrap();

    (skeleton, server, CoStream::new(client_end).unwrap())
}

#[test]
fn echo_roundtrip() {
    run(|| {
        let (skeleton, server, stream) = echo_server();
        let stub = Stub::new(stream);

        let request = vec![0xAB; 4096];
        let mut response = Vec::new();
        let n = stub
            .call(ECHO, &request, &mut response, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(n, request.len());
        assert_eq!(response, request);

        skeleton.shutdown();
        server.join();
    });
}

#[test]
fn zero_size_frames_are_valid() {
    run(|| {
        let (skeleton, server, stream) = echo_server();
        let stub = Stub::new(stream);

        let mut response = vec![0xFF; 16];
        let n = stub
            .call(ECHO, &[], &mut response, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(n, 0);
        assert!(response.is_empty());

        skeleton.shutdown();
        server.join();
    });
}

#[test]
fn responses_complete_out_of_order() {
    run(|| {
        let (skeleton, server, stream) = echo_server();
        let stub = Rc::new(Stub::new(stream));

        let slow_stub = stub.clone();
        let slow = fiber::defer(move || {
            let t0 = Instant::now();
            let mut response = Vec::new();
            slow_stub
                .call(SLOW_ECHO, b"slow", &mut response, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(response, b"slow");
            t0.elapsed()
        });
        let fast_stub = stub.clone();
        let fast = fiber::defer(move || {
            let t0 = Instant::now();
            let mut response = Vec::new();
            fast_stub
                .call(ECHO, b"fast", &mut response, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(response, b"fast");
            t0.elapsed()
        });

        let slow_elapsed = slow.join();
        let fast_elapsed = fast.join();
        // The fast call was submitted second but finished first.
        assert!(fast_elapsed < slow_elapsed);
        assert!(slow_elapsed >= Duration::from_millis(50));

        skeleton.shutdown();
        server.join();
    });
}

#[test]
fn timed_out_response_is_discarded_later() {
    run(|| {
        let (skeleton, server, stream) = echo_server();
        let stub = Rc::new(Stub::new(stream));

        let mut response = Vec::new();
        match stub.call(SLOW_ECHO, b"late", &mut response, Some(Duration::from_millis(5))) {
            Err(Error::Timeout) => {}
            other => panic!("expected a timeout, got {:?}", other),
        }

        // The stream stays open; the late response is skipped when the
        // next call reads past it.
        fiber::sleep_us(100_000);
        let n = stub
            .call(ECHO, b"fresh", &mut response, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(response, b"fresh");

        skeleton.shutdown();
        server.join();
    });
}

#[test]
fn magic_mismatch_resets_the_connection() {
    run(|| {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let garbage_server = fiber::defer_proc(move || {
            let mut stream = CoStream::new(server_end).unwrap();
            // Swallow the request header + body.
            let mut buf = [0u8; 64];
            let mut got = 0;
            while got < 36 {
                got += stream.read(&mut buf).unwrap();
            }
            // Answer with something that is not a frame.
            stream.write_all(&[0xFF; 32]).unwrap();
            // Hold the stream open until the client has reacted.
            fiber::sleep_us(100_000);
        });

        let stub = Stub::new(CoStream::new(client_end).unwrap());
        let mut response = Vec::new();
        match stub.call(ECHO, b"ping", &mut response, Some(Duration::from_secs(5))) {
            Err(Error::ConnectionReset) => {}
            other => panic!("expected a connection reset, got {:?}", other),
        }
        garbage_server.join();
    });
}

#[test]
fn unknown_function_shuts_the_stream_down() {
    run(|| {
        let (skeleton, server, stream) = echo_server();
        let stub = Stub::new(stream);

        let mut response = Vec::new();
        let unknown = FunctionId::new(1, 999);
        match stub.call(unknown, b"?", &mut response, Some(Duration::from_secs(5))) {
            Err(Error::ConnectionReset) => {}
            other => panic!("expected a connection reset, got {:?}", other),
        }

        skeleton.shutdown();
        server.join();
    });
}

#[test]
fn header_sizes_carry_independent_directions() {
    run(|| {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let skeleton = Skeleton::new(false);
        // Response is larger than the request.
        skeleton
            .add_function(ECHO, |_header, body| body.repeat(3))
            .unwrap();
        let serve_skeleton = skeleton.clone();
        let server = fiber::defer_proc(move || {
            let _ = serve_skeleton.serve(CoStream::new(server_end).unwrap());
        });

        let stub = Stub::new(CoStream::new(client_end).unwrap());
        let mut response = Vec::new();
        let n = stub
            .call(ECHO, b"abc", &mut response, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(response, b"abcabcabc");

        skeleton.shutdown();
        server.join();
    });
}
