mod common;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use rstest::*;
use tokio::time::{sleep, Duration};

use chanmesh::{Callback, Handler, LocalServer, Ret, RpcError, Value};

fn add_server(inbox: usize) -> LocalServer {
    let mut s = LocalServer::new(inbox);
    s.register(
        "add",
        Handler::h1(|args, _ext| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(Value::from(a + b))
        }),
    );
    s
}

#[rstest]
fn test_sync_call(runner: TestRunner) {
    runner.block_on(async move {
        let s = add_server(16);
        let mut c = s.open(4);
        let mut s = s;
        tokio::spawn(async move { s.run().await });

        let r = c.call1("add", vec![Value::from(2), Value::from(3)]).await.expect("call1");
        assert_eq!(r, Value::from(5));
    });
}

#[rstest]
fn test_shape_and_registration_errors(runner: TestRunner) {
    runner.block_on(async move {
        let mut s = add_server(16);
        s.register("notify", Handler::h0(|_args, _ext| {}));
        let mut c = s.open(0);

        // wrong style for the registered shape, checked before enqueueing
        assert_eq!(c.call1("notify", vec![]).await.unwrap_err(), RpcError::ShapeMismatch);
        assert_eq!(c.call0("add", vec![]).await.unwrap_err(), RpcError::ShapeMismatch);
        assert_eq!(c.call1("nothing", vec![]).await.unwrap_err(), RpcError::NotRegistered);

        let mut detached = chanmesh::LocalClient::new(0);
        assert_eq!(detached.call0("add", vec![]).await.unwrap_err(), RpcError::NotAttached);
    });
}

#[test]
#[should_panic]
fn test_duplicate_register() {
    let mut s = LocalServer::new(4);
    s.register("twice", Handler::h0(|_args, _ext| {}));
    s.register("twice", Handler::he(|_args, _ext| Ok(())));
}

#[rstest]
fn test_external_ret(runner: TestRunner) {
    runner.block_on(async move {
        let mut s = LocalServer::new(16);
        s.register(
            "delayed",
            Handler::h1(|_args, ext| {
                let r = ext.take();
                tokio::spawn(async move {
                    sleep(Duration::from_millis(50)).await;
                    r.send(Ok(Ret::One(Value::from(42))));
                });
                // discarded, the responder owns the outcome now
                Ok(Value::Nil)
            }),
        );
        let mut c = s.open(4);
        let mut s = s;
        tokio::spawn(async move { s.run().await });

        let seen = Arc::new(AtomicI64::new(0));
        let seen2 = seen.clone();
        c.asyn_call(
            "delayed",
            vec![],
            Callback::one(move |r| {
                seen2.store(r.expect("delayed").as_i64().unwrap(), Ordering::Release);
            }),
        );
        assert_eq!(c.pending_asyn(), 1);
        assert!(!c.idle());

        let ri = c.asyn_ret_rx().recv().await.expect("asyn ret");
        c.cb(ri);
        assert!(c.idle());
        assert_eq!(seen.load(Ordering::Acquire), 42);
    });
}

#[rstest]
fn test_queue_full(runner: TestRunner) {
    runner.block_on(async move {
        // inbox of one, nobody draining
        let mut s = LocalServer::new(1);
        s.register("noop", Handler::h0(|_args, _ext| {}));
        let c = s.open(0);

        c.go("noop", vec![]);

        let got: Arc<Mutex<Option<RpcError>>> = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        c.rpc_call(
            "noop",
            vec![],
            Some(Box::new(move |ri| {
                *got2.lock().unwrap() = ri.err;
            })),
        );
        assert_eq!(*got.lock().unwrap(), Some(RpcError::QueueFull));
    });
}

#[rstest]
fn test_too_many_calls(runner: TestRunner) {
    runner.block_on(async move {
        let s = add_server(16);
        // capacity-0 ring: any async call is over capacity
        let mut c = s.open(0);
        let hit = Arc::new(AtomicBool::new(false));
        let hit2 = hit.clone();
        c.asyn_call(
            "add",
            vec![Value::from(1), Value::from(1)],
            Callback::one(move |r| {
                assert_eq!(r.unwrap_err(), RpcError::TooManyCalls);
                hit2.store(true, Ordering::Release);
            }),
        );
        assert!(hit.load(Ordering::Acquire));
        assert!(c.idle());
    });
}

#[rstest]
fn test_asyn_enqueue_failure_through_ring(runner: TestRunner) {
    runner.block_on(async move {
        let mut s = LocalServer::new(1);
        s.register(
            "echo",
            Handler::h1(|args, _ext| Ok(args[0].clone())),
        );
        let mut c = s.open(4);

        // first call fills the inbox, second is rejected and synthesized
        c.asyn_call("echo", vec![Value::from(1)], Callback::one(|r| {
            assert_eq!(r.expect("first echo"), Value::from(1));
        }));
        let full = Arc::new(AtomicBool::new(false));
        let full2 = full.clone();
        c.asyn_call(
            "echo",
            vec![Value::from(2)],
            Callback::one(move |r| {
                assert_eq!(r.unwrap_err(), RpcError::QueueFull);
                full2.store(true, Ordering::Release);
            }),
        );
        assert_eq!(c.pending_asyn(), 2);

        // the synthesized outcome is already on the ring
        let ri = c.asyn_ret_rx().recv().await.expect("ring");
        c.cb(ri);
        assert!(full.load(Ordering::Acquire));

        // now drain the real one
        let mut s = s;
        tokio::spawn(async move { s.run().await });
        let ri = c.asyn_ret_rx().recv().await.expect("ring");
        c.cb(ri);
        assert!(c.idle());
    });
}

#[rstest]
fn test_handler_panic_contained(runner: TestRunner) {
    runner.block_on(async move {
        let mut s = add_server(16);
        s.register(
            "boom",
            Handler::h1(|_args, _ext| -> Result<Value, RpcError> { panic!("boom payload") }),
        );
        let mut c = s.open(0);
        let mut s = s;
        tokio::spawn(async move { s.run().await });

        match c.call1("boom", vec![]).await.unwrap_err() {
            RpcError::HandlerPanic(msg) => assert!(msg.contains("boom payload")),
            other => panic!("unexpected error {:?}", other),
        }
        // dispatch survived the panic
        let r = c.call1("add", vec![Value::from(20), Value::from(22)]).await.expect("add");
        assert_eq!(r, Value::from(42));
    });
}

#[rstest]
fn test_per_caller_order(runner: TestRunner) {
    runner.block_on(async move {
        let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        let mut s = LocalServer::new(64);
        s.register(
            "rec",
            Handler::h0(move |args, _ext| {
                order2.lock().unwrap().push(args[0].as_i64().unwrap());
            }),
        );
        s.register("fin", Handler::he(|_args, _ext| Ok(())));
        let mut c = s.open(0);

        for i in 0..10 {
            c.go("rec", vec![Value::from(i)]);
        }
        let mut s = s;
        tokio::spawn(async move { s.run().await });

        // sync barrier: everything enqueued before it has been executed
        c.call0("fin", vec![]).await.expect("fin");
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<i64>>());
    });
}

#[rstest]
fn test_server_close_drains(runner: TestRunner) {
    runner.block_on(async move {
        let mut s = LocalServer::new(8);
        s.register("noop", Handler::he(|_args, _ext| Ok(())));
        let mut c = s.open(0);

        let got: Arc<Mutex<Option<RpcError>>> = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        c.rpc_call(
            "noop",
            vec![],
            Some(Box::new(move |ri| {
                *got2.lock().unwrap() = ri.err;
            })),
        );
        s.close();
        assert_eq!(*got.lock().unwrap(), Some(RpcError::ServerClosing));

        // enqueueing after close fails the same way
        assert_eq!(c.call0("noop", vec![]).await.unwrap_err(), RpcError::ServerClosing);
    });
}

#[rstest]
fn test_client_close_waits_for_pending(runner: TestRunner) {
    runner.block_on(async move {
        let mut s = LocalServer::new(16);
        s.register(
            "slow",
            Handler::he(|_args, ext| {
                let r = ext.take();
                tokio::spawn(async move {
                    sleep(Duration::from_millis(20)).await;
                    r.send(Ok(Ret::None));
                });
                Ok(())
            }),
        );
        let mut c = s.open(8);
        let mut s = s;
        tokio::spawn(async move { s.run().await });

        let done = Arc::new(AtomicI64::new(0));
        for _ in 0..3 {
            let done2 = done.clone();
            c.asyn_call(
                "slow",
                vec![],
                Callback::e(move |r| {
                    r.expect("slow");
                    done2.fetch_add(1, Ordering::AcqRel);
                }),
            );
        }
        assert_eq!(c.pending_asyn(), 3);
        c.close().await;
        assert!(c.idle());
        assert_eq!(done.load(Ordering::Acquire), 3);
    });
}

#[rstest]
fn test_handle_shortcut_calls(runner: TestRunner) {
    runner.block_on(async move {
        let mut s = add_server(16);
        s.register("pair", Handler::hn(|args, _ext| Ok(vec![args[1].clone(), args[0].clone()])));
        s.register("tick", Handler::h0(|_args, _ext| {}));
        let h = s.handle();
        let mut s = s;
        tokio::spawn(async move { s.run().await });

        let r = h.call1("add", vec![Value::from(1), Value::from(2)]).await.expect("add");
        assert_eq!(r, Value::from(3));
        let r = h.calln("pair", vec![Value::from(1), Value::from(2)]).await.expect("pair");
        assert_eq!(r, vec![Value::from(2), Value::from(1)]);
        h.go("tick", vec![]);
        h.call0("fin", vec![]).await.unwrap_err();
    });
}
