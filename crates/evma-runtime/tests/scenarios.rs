//! End-to-end scenarios across scheduler, reactor, and resources.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use evma_core::parsers::{Exact, Line};
use evma_core::value::Value;
use evma_runtime::{open, IStream, Outcome, Progress, Runtime, RuntimeConfig, EXIT_SUCCESS};

fn rt() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("runtime construction")
}

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn write_all(fd: RawFd, data: &[u8]) {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    assert_eq!(n as usize, data.len());
}

/// A line read whose bytes arrive in two chunks with the stop byte only in
/// the second: the reader suspends once and is resumed exactly once, with
/// the full line.
#[test]
fn buffered_read_across_chunks_resumes_once() {
    let mut rt = rt();
    let (r, w) = pipe_pair();

    // First chunk is already buffered when the read starts
    write_all(w, b"ab");
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        write_all(w, b"cdef\n");
        unsafe { libc::close(w) };
    });

    let resumptions = Rc::new(RefCell::new(0u32));
    let result = Rc::new(RefCell::new(None));

    let is = IStream::from_raw_fd(r);
    let counter = resumptions.clone();
    let result2 = result.clone();
    let mut started = false;
    rt.spawn_fn(move |rt, args| {
        if !started {
            started = true;
            return match is.readp(rt, Box::new(Line::new(b'\n'))) {
                Progress::Complete(vals) => {
                    *result2.borrow_mut() = Some(vals);
                    Outcome::Finished
                }
                Progress::Suspended => Outcome::Suspended,
            };
        }
        *counter.borrow_mut() += 1;
        *result2.borrow_mut() = Some(args);
        Outcome::Finished
    });

    assert_eq!(rt.run(), EXIT_SUCCESS);
    writer.join().unwrap();

    assert_eq!(*resumptions.borrow(), 1, "exactly one resumption");
    let result = result.borrow();
    let vals = result.as_ref().expect("read never completed");
    assert_eq!(vals[0].as_bytes(), Some(b"abcdef".as_ref()));
}

/// A second operation on a busy resource is rejected with "busy" and does
/// not disturb the outstanding one.
#[test]
fn busy_resource_rejects_second_operation() {
    let mut rt = rt();
    let (r, w) = pipe_pair();

    let is = IStream::from_raw_fd(r);
    let log = Rc::new(RefCell::new(Vec::<String>::new()));

    // Reader: suspends forever (nothing is ever written)
    let reader_stream = is.clone();
    let log_r = log.clone();
    let mut started = false;
    rt.spawn_fn(move |rt, args| {
        if !started {
            started = true;
            return match reader_stream.readp(rt, Box::new(Line::default())) {
                Progress::Complete(_) => panic!("empty pipe must suspend"),
                Progress::Suspended => Outcome::Suspended,
            };
        }
        log_r
            .borrow_mut()
            .push(format!("reader:{:?}", args[1].as_str().unwrap()));
        Outcome::Finished
    });

    // Second task: gets busy-rejected, then closes the stream, which
    // interrupts the reader
    let log_c = log.clone();
    rt.spawn_fn(move |rt, _| {
        match is.readp(rt, Box::new(Line::default())) {
            Progress::Complete(vals) => {
                assert!(vals[0].is_nil());
                log_c
                    .borrow_mut()
                    .push(format!("second:{:?}", vals[1].as_str().unwrap()));
            }
            Progress::Suspended => panic!("busy stream must reject, not queue"),
        }
        let closed = is.close(rt);
        assert_eq!(closed[0], Value::Bool(true));
        Outcome::Finished
    });

    assert_eq!(rt.run(), EXIT_SUCCESS);
    unsafe { libc::close(w) };

    let log = log.borrow();
    assert_eq!(
        *log,
        vec![
            "second:\"busy\"".to_owned(),
            "reader:\"interrupted\"".to_owned(),
        ]
    );
}

/// Closing a stream with an outstanding read resolves the reader with
/// "interrupted" (never a "closed" result), removes the registration, and
/// fires no late resumption.
#[test]
fn close_interrupts_outstanding_read() {
    let mut rt = rt();
    let (r, w) = pipe_pair();

    let is = IStream::from_raw_fd(r);
    let reader_results = Rc::new(RefCell::new(Vec::<String>::new()));

    let reader_stream = is.clone();
    let results = reader_results.clone();
    let mut started = false;
    rt.spawn_fn(move |rt, args| {
        if !started {
            started = true;
            return match reader_stream.readp(rt, Box::new(Line::default())) {
                Progress::Complete(_) => panic!("empty pipe must suspend"),
                Progress::Suspended => Outcome::Suspended,
            };
        }
        results
            .borrow_mut()
            .push(args[1].as_str().unwrap().to_owned());
        Outcome::Finished
    });

    rt.spawn_fn(move |rt, _| {
        // close() must resolve the pending read before the fd goes away
        let closed = is.close(rt);
        assert_eq!(closed[0], Value::Bool(true));
        // No registration is left behind
        assert_eq!(is.interrupt(rt)[1].as_str(), Some("not busy"));
        Outcome::Finished
    });

    assert_eq!(rt.run(), EXIT_SUCCESS);
    unsafe { libc::close(w) };

    // Exactly one resumption, and it observed "interrupted"
    assert_eq!(*reader_results.borrow(), vec!["interrupted".to_owned()]);
}

/// Parked tasks resume in enqueue order, not spawn order.
#[test]
fn fifo_follows_enqueue_order() {
    let mut rt = rt();
    let order = Rc::new(RefCell::new(Vec::<u64>::new()));

    let mut parked = Vec::new();
    for i in 0..3u64 {
        let order = order.clone();
        let mut started = false;
        parked.push(rt.spawn_fn(move |rt, _| {
            if !started {
                started = true;
                rt.park();
                return Outcome::Suspended;
            }
            order.borrow_mut().push(i);
            Outcome::Finished
        }));
    }

    let targets = parked.clone();
    rt.spawn_fn(move |rt, _| {
        // Wake in an order unlike the spawn order
        for idx in [2usize, 0, 1] {
            let r = rt.resume(&targets[idx], vec![]);
            assert_eq!(r[0], Value::Bool(true));
        }
        Outcome::Finished
    });

    assert_eq!(rt.run(), EXIT_SUCCESS);
    assert_eq!(*order.borrow(), vec![2, 0, 1]);
}

/// Double-resume of a parked task: the first enqueue wins, the second is
/// reported as a contract violation.
#[test]
fn double_resume_of_parked_task_is_detected() {
    let mut rt = rt();

    let mut started = false;
    let parked = rt.spawn_fn(move |rt, _| {
        if !started {
            started = true;
            rt.park();
            return Outcome::Suspended;
        }
        Outcome::Finished
    });

    rt.spawn_fn(move |rt, _| {
        assert_eq!(rt.resume(&parked, vec![])[0], Value::Bool(true));
        let second = rt.resume(&parked, vec![]);
        assert!(second[0].is_nil());
        assert_eq!(second[1].as_str(), Some("already queued"));
        Outcome::Finished
    });

    assert_eq!(rt.run(), EXIT_SUCCESS);
}

/// Worker-thread file path end to end: open, exact read, size, close.
#[test]
fn file_open_read_size() {
    let path = std::env::temp_dir().join(format!("evma-test-{}", std::process::id()));
    std::fs::write(&path, b"0123456789").unwrap();
    let path_str = path.to_str().unwrap().to_owned();

    let mut rt = rt();
    let log = Rc::new(RefCell::new(Vec::<String>::new()));

    let log2 = log.clone();
    let mut step = 0;
    let file = Rc::new(RefCell::new(None::<evma_runtime::File>));
    rt.spawn_fn(move |rt, args| {
        match step {
            0 => {
                step = 1;
                match open(rt, &path_str, "r") {
                    Progress::Suspended => Outcome::Suspended,
                    Progress::Complete(_) => panic!("open runs on a worker"),
                }
            }
            1 => {
                step = 2;
                let f = args[0]
                    .downcast::<evma_runtime::File>()
                    .expect("open returns a file for a regular path")
                    .clone();
                *file.borrow_mut() = Some(f.clone());
                match f.readp(rt, Box::new(Exact::new(4))) {
                    Progress::Suspended => Outcome::Suspended,
                    Progress::Complete(_) => panic!("first file read goes to a worker"),
                }
            }
            2 => {
                step = 3;
                log2.borrow_mut().push(format!(
                    "read:{}",
                    String::from_utf8_lossy(args[0].as_bytes().unwrap())
                ));
                let f = file.borrow().clone().unwrap();
                match f.size(rt) {
                    Progress::Suspended => Outcome::Suspended,
                    Progress::Complete(_) => panic!("size runs on a worker"),
                }
            }
            _ => {
                log2
                    .borrow_mut()
                    .push(format!("size:{}", args[0].as_int().unwrap()));
                let f = file.borrow().clone().unwrap();
                assert_eq!(f.close(rt)[0], Value::Bool(true));
                Outcome::Finished
            }
        }
    });

    assert_eq!(rt.run(), EXIT_SUCCESS);
    std::fs::remove_file(&path).unwrap();

    assert_eq!(
        *log.borrow(),
        vec!["read:0123".to_owned(), "size:10".to_owned()]
    );
}

/// A second exact read picks up the leftover bytes the first one did not
/// consume: the shared buffer retires exactly what each decode used.
#[test]
fn file_sequential_decodes_share_leftover() {
    let path = std::env::temp_dir().join(format!("evma-test-seq-{}", std::process::id()));
    std::fs::write(&path, b"aaaabbbb").unwrap();
    let path_str = path.to_str().unwrap().to_owned();

    let mut rt = rt();
    let reads = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));

    let reads2 = reads.clone();
    let mut step = 0;
    let file = Rc::new(RefCell::new(None::<evma_runtime::File>));
    rt.spawn_fn(move |rt, args| {
        match step {
            0 => {
                step = 1;
                match open(rt, &path_str, "r") {
                    Progress::Suspended => Outcome::Suspended,
                    Progress::Complete(_) => panic!("open runs on a worker"),
                }
            }
            1 => {
                step = 2;
                let f = args[0].downcast::<evma_runtime::File>().unwrap().clone();
                *file.borrow_mut() = Some(f.clone());
                match f.readp(rt, Box::new(Exact::new(4))) {
                    Progress::Suspended => Outcome::Suspended,
                    Progress::Complete(_) => panic!("first read goes to a worker"),
                }
            }
            2 => {
                step = 3;
                reads2.borrow_mut().push(args[0].as_bytes().unwrap().to_vec());
                let f = file.borrow().clone().unwrap();
                // The worker read buffered the whole file; this decode
                // completes synchronously from the leftover
                match f.readp(rt, Box::new(Exact::new(4))) {
                    Progress::Complete(vals) => {
                        reads2.borrow_mut().push(vals[0].as_bytes().unwrap().to_vec());
                        Outcome::Finished
                    }
                    Progress::Suspended => Outcome::Suspended,
                }
            }
            _ => {
                reads2.borrow_mut().push(args[0].as_bytes().unwrap().to_vec());
                Outcome::Finished
            }
        }
    });

    assert_eq!(rt.run(), EXIT_SUCCESS);
    std::fs::remove_file(&path).unwrap();

    assert_eq!(*reads.borrow(), vec![b"aaaa".to_vec(), b"bbbb".to_vec()]);
}
