//! TCP handoff tests: a collection that requests migration gets shipped
//! to a listening node, which resumes it to completion.

use mobilize::host;
use mobilize::image::{Asm, MethodFlags, MethodId, MobileOp, Op, Program, ProgramBuilder, Ty, TypeFlags};
use mobilize::runtime::Invocation;
use mobilize::translate::Rewriter;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

/// Prints `0..limit` and requests migration to `addr` right after
/// printing `request_at`; a flag local suppresses the request once the
/// context resumes on the receiving node.
fn counting_loop(limit: i32, request_at: i32, addr: &str) -> (Program, MethodId) {
    let mut asm = Asm::new();
    let i = asm.local(Ty::I32);
    let requested = asm.local(Ty::I32);
    let head = asm.label();
    let skip = asm.label();
    asm.place(head);
    asm.op(Op::LoadLocal(i));
    asm.op(Op::Print);
    asm.op(Op::LoadLocal(requested));
    asm.br_true(skip);
    asm.op(Op::LoadLocal(i));
    asm.op(Op::ConstI32(request_at));
    asm.op(Op::CmpEq);
    asm.br_false(skip);
    asm.op(Op::ConstI32(1));
    asm.op(Op::StoreLocal(requested));
    asm.op(Op::ConstStr(addr.to_owned()));
    asm.op(Op::Mobile(MobileOp::RequestMigration));
    asm.place(skip);
    asm.op(Op::LoadLocal(i));
    asm.op(Op::ConstI32(1));
    asm.op(Op::Add);
    asm.op(Op::StoreLocal(i));
    asm.op(Op::LoadLocal(i));
    asm.op(Op::ConstI32(limit));
    asm.op(Op::CmpLt);
    asm.br_true(head);
    asm.op(Op::Ret);

    let mut b = ProgramBuilder::new();
    let app = b.add_type("App", TypeFlags::empty());
    let id = b.add_method(app, "m", MethodFlags::STATIC, vec![], None, Some(asm.finish()));
    (b.finish(), id)
}

#[test]
fn contexts_migrate_over_tcp_and_finish_remotely() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // The receiving node serves exactly two handoffs, back to back
    let server = thread::spawn(move || host::serve(listener, Some(2)).unwrap());

    for request_at in [2, 0] {
        let (p, id) = counting_loop(5, request_at, &addr);
        let rewritten = Arc::new(Rewriter::rewrite(&p).unwrap());
        let served = host::run_standalone(
            Arc::clone(&rewritten),
            Invocation { method: id, receiver: None, args: vec![] },
        )
        .unwrap();
        // The origin finished nothing; the context left mid-loop
        assert_eq!(served.finished, 0);
        assert_eq!(served.forwarded.as_deref(), Some(addr.as_str()));
    }

    let served = server.join().unwrap();
    assert_eq!(served.len(), 2);
    for outcome in served {
        assert_eq!(outcome.finished, 1);
        assert!(outcome.forwarded.is_none());
    }
}
