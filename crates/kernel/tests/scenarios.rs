// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! End-to-end scenarios: property changes, cross-thread bindings, process
//! namespace fan-out, stale handles, and bindings surviving a connection
//! teardown. All tests share one process namespace, so every name carries a
//! test-unique suffix.

use arbor_kernel::{
    add_property_double, classid, oid, propertyset_done, v_double, v_str, BindFlags, ClassId,
    Command, ConnConfig, Connection, Content, EndPoint, Envelope, NameFlags, ObjCtx, ObjFlags,
    ObjThread, ObjectBehavior, Payload, Tree, Var,
};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

const CLS_GAUGE: ClassId = classid::USER_BASE + 10;
const P_TEMP: i32 = 1;

const CLS_PANEL: ClassId = classid::USER_BASE + 11;
const P_DISPLAY: i32 = 1;

const CLS_PROBE: ClassId = classid::USER_BASE + 12;

fn setup_classes() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        add_property_double(
            CLS_GAUGE,
            P_TEMP,
            "temp",
            arbor_kernel::PropFlags::PERSISTENT,
            20.0,
            2,
        );
        propertyset_done(CLS_GAUGE);
        add_property_double(
            CLS_PANEL,
            P_DISPLAY,
            "display",
            arbor_kernel::PropFlags::PERSISTENT,
            0.0,
            2,
        );
        propertyset_done(CLS_PANEL);
    });
}

/// Mirrors its single property into shared state so the test can watch a
/// value that lives on another thread.
struct Mirror {
    nr: i32,
    value: Arc<Mutex<f64>>,
}

impl ObjectBehavior for Mirror {
    fn on_property_change(&mut self, _ctx: &mut ObjCtx<'_>, propertynr: i32, x: &Var) {
        if propertynr == self.nr {
            *self.value.lock().unwrap() = x.get_double();
        }
    }
}

/// Records every message that lands on it.
#[derive(Clone, Default)]
struct ProbeLog {
    entries: Arc<Mutex<Vec<(Command, String, String)>>>,
}

impl ProbeLog {
    fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<(Command, String, String)> {
        self.entries.lock().unwrap().clone()
    }
}

struct Probe {
    log: ProbeLog,
}

impl ObjectBehavior for Probe {
    fn on_message(&mut self, _ctx: &mut ObjCtx<'_>, env: &Envelope) -> bool {
        let content = match &env.content {
            Some(Content::Value(v)) => v.to_text().into_owned(),
            _ => String::new(),
        };
        self.log.entries.lock().unwrap().push((
            env.command,
            env.source.as_str().to_string(),
            content,
        ));
        true
    }
}

fn wait_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn add_gauge(tree: &mut Tree, parent: arbor_kernel::Oix, mirror: Arc<Mutex<f64>>) -> arbor_kernel::Oix {
    tree.add_custom(
        parent,
        oid::ITEM,
        ObjFlags::default(),
        CLS_GAUGE,
        Box::new(Mirror {
            nr: P_TEMP,
            value: mirror,
        }),
    )
    .unwrap()
}

fn add_panel(tree: &mut Tree, parent: arbor_kernel::Oix, mirror: Arc<Mutex<f64>>) -> arbor_kernel::Oix {
    tree.add_custom(
        parent,
        oid::ITEM,
        ObjFlags::default(),
        CLS_PANEL,
        Box::new(Mirror {
            nr: P_DISPLAY,
            value: mirror,
        }),
    )
    .unwrap()
}

#[test]
fn property_change_stays_local() {
    setup_classes();
    let mut t = ObjThread::new();
    let root = t.root();
    let mirror = Arc::new(Mutex::new(-1.0));
    let gauge = add_gauge(&mut t.tree, root, mirror.clone());

    t.tree
        .set_property(gauge, P_TEMP, &v_double(40.0), None)
        .unwrap();

    assert_eq!(*mirror.lock().unwrap(), 40.0);
    let mut v = Var::new();
    t.tree.get_property(gauge, P_TEMP, &mut v).unwrap();
    assert_eq!(v.get_double(), 40.0);
    // No envelope went anywhere: the thread queue is untouched.
    assert!(t.try_queue().is_none());
}

#[test]
fn binding_across_threads_converges_both_ways() {
    setup_classes();

    let mut t1 = ObjThread::new();
    let mirror_a = Arc::new(Mutex::new(-1.0));
    let t1_root = t1.root();
    let a = add_gauge(&mut t1.tree, t1_root, mirror_a.clone());
    t1.tree.add_name(a, "A", NameFlags::default(), None).unwrap();
    t1.add_process_name("T1_xthread").unwrap();

    let mut t2 = ObjThread::new();
    let mirror_b = Arc::new(Mutex::new(-1.0));
    let t2_root = t2.root();
    let b = add_panel(&mut t2.tree, t2_root, mirror_b.clone());
    t2.tree.add_name(b, "B", NameFlags::default(), None).unwrap();
    t2.add_process_name("T2_xthread").unwrap();

    t2.tree
        .bind(b, P_DISPLAY, "//T1_xthread/A/_p/temp", None, BindFlags::default())
        .unwrap();

    let h1 = t1.spawn();
    let h2 = t2.spawn();

    // Server-initialized: the display adopts the gauge's current value.
    wait_until("display to adopt 20.0", || *mirror_b.lock().unwrap() == 20.0);

    // A change on the gauge side flows to the panel...
    let mut main = Tree::new(classid::CONTAINER, Payload::Container);
    let main_root = main.root();
    main.set_property_msg(main_root, "//T1_xthread/A", &v_double(30.0), Some("temp"));
    wait_until("display to follow 30.0", || *mirror_b.lock().unwrap() == 30.0);

    // ...and a change on the panel side flows back to the gauge.
    main.set_property_msg(main_root, "//T2_xthread/B", &v_double(45.0), Some("display"));
    wait_until("gauge to follow 45.0", || *mirror_a.lock().unwrap() == 45.0);

    h1.terminate();
    h2.terminate();
}

#[test]
fn client_init_binding_pushes_client_value() {
    setup_classes();

    let mut t1 = ObjThread::new();
    let mirror_a = Arc::new(Mutex::new(-1.0));
    let t1_root = t1.root();
    let a = add_gauge(&mut t1.tree, t1_root, mirror_a.clone());
    t1.tree.add_name(a, "A", NameFlags::default(), None).unwrap();
    t1.add_process_name("T1_clientinit").unwrap();

    let mut t2 = ObjThread::new();
    let mirror_b = Arc::new(Mutex::new(-1.0));
    let t2_root = t2.root();
    let b = add_panel(&mut t2.tree, t2_root, mirror_b.clone());
    t2.tree
        .bind(
            b,
            P_DISPLAY,
            "//T1_clientinit/A/_p/temp",
            None,
            BindFlags::CLIENTINIT,
        )
        .unwrap();

    let h1 = t1.spawn();
    let h2 = t2.spawn();

    // The client's default (0.0) wins over the server's 20.0.
    wait_until("gauge to adopt client 0.0", || *mirror_a.lock().unwrap() == 0.0);

    h1.terminate();
    h2.terminate();
}

#[test]
fn process_name_fans_out_once_per_owner() {
    setup_classes();
    let log1 = ProbeLog::default();
    let log2 = ProbeLog::default();

    let mut t1 = ObjThread::new();
    let p1 = t1
        .tree
        .add_custom(
            t1.root(),
            oid::ITEM,
            ObjFlags::default(),
            CLS_PROBE,
            Box::new(Probe { log: log1.clone() }),
        )
        .unwrap();
    t1.tree
        .add_name(p1, "log_fanout", NameFlags::PROCESS_NS, None)
        .unwrap();

    let mut t2 = ObjThread::new();
    let p2 = t2
        .tree
        .add_custom(
            t2.root(),
            oid::ITEM,
            ObjFlags::default(),
            CLS_PROBE,
            Box::new(Probe { log: log2.clone() }),
        )
        .unwrap();
    t2.tree
        .add_name(p2, "log_fanout", NameFlags::PROCESS_NS, None)
        .unwrap();

    let h1 = t1.spawn();
    let h2 = t2.spawn();

    let mut main = Tree::new(classid::CONTAINER, Payload::Container);
    let main_root = main.root();
    let sender_token = main.oix_token(main_root);
    let env = Envelope::new(Command(Command::USER_BASE.0 + 1))
        .with_target("//log_fanout")
        .with_value(v_str("hello"));
    main.send(main_root, env);

    wait_until("both probes to hear it", || log1.count() >= 1 && log2.count() >= 1);
    std::thread::sleep(Duration::from_millis(100));

    // Exactly once each, same content, and the source names the sender.
    for log in [&log1, &log2] {
        let entries = log.snapshot();
        assert_eq!(entries.len(), 1);
        let (command, source, content) = &entries[0];
        assert_eq!(*command, Command(Command::USER_BASE.0 + 1));
        assert_eq!(source, &sender_token);
        assert_eq!(content, "hello");
    }

    h1.terminate();
    h2.terminate();
}

#[test]
fn stale_handle_is_rejected_with_no_target() {
    setup_classes();
    let root_log = ProbeLog::default();
    let mut t = ObjThread::with_behavior(
        CLS_PROBE,
        Box::new(Probe {
            log: root_log.clone(),
        }),
    );
    let root = t.root();

    let o = t
        .tree
        .add_container(root, oid::ITEM, ObjFlags::default())
        .unwrap();
    let stale = t.tree.objref(o).unwrap();
    t.tree.delete(o);

    // The replacement reuses the slot with a new generation.
    let target_log = ProbeLog::default();
    let o2 = t
        .tree
        .add_custom(
            root,
            oid::ITEM,
            ObjFlags::default(),
            CLS_PROBE,
            Box::new(Probe {
                log: target_log.clone(),
            }),
        )
        .unwrap();
    let fresh = t.tree.objref(o2).unwrap();
    assert_eq!(fresh.oix, stale.oix);
    assert_ne!(fresh.ucnt, stale.ucnt);

    // The preserved stale identity bounces with NO_TARGET.
    let env = Envelope::new(Command(Command::USER_BASE.0 + 2)).with_target(&stale.to_string());
    t.tree.send(root, env);
    assert_eq!(root_log.count(), 1);
    assert_eq!(root_log.snapshot()[0].0, Command::NO_TARGET);
    assert_eq!(target_log.count(), 0);

    // The fresh identity goes through.
    let env = Envelope::new(Command(Command::USER_BASE.0 + 2)).with_target(&fresh.to_string());
    t.tree.send(root, env);
    assert_eq!(target_log.count(), 1);
}

#[test]
fn binding_survives_connection_teardown() {
    setup_classes();

    // Server process half: a gauge reachable as S_conn/srv.
    let mut s = ObjThread::new();
    let mirror_srv = Arc::new(Mutex::new(-1.0));
    let s_root = s.root();
    let srv = add_gauge(&mut s.tree, s_root, mirror_srv.clone());
    s.tree.add_name(srv, "srv", NameFlags::default(), None).unwrap();
    s.add_process_name("S_conn").unwrap();
    let hs = s.spawn();

    let (h_ep, bound) = EndPoint::spawn("127.0.0.1:0", None).unwrap();
    let port = bound.port();

    // Client half: a panel bound through the connection.
    let mut cfg = ConnConfig::to(&format!("127.0.0.1:{port}"));
    cfg.reconnect = Duration::from_millis(150);
    cfg.connect_timeout = Duration::from_millis(500);
    let h_conn = Connection::spawn(cfg, Some("conn_reb"));

    let mut c = ObjThread::new();
    let mirror_panel = Arc::new(Mutex::new(-1.0));
    let c_root = c.root();
    let panel = add_panel(&mut c.tree, c_root, mirror_panel.clone());
    c.tree
        .bind(
            panel,
            P_DISPLAY,
            "//conn_reb/S_conn/srv/_p/temp",
            None,
            BindFlags::default(),
        )
        .unwrap();
    let hc = c.spawn();

    // Steady state over the wire.
    wait_until("panel to adopt 20.0 over the wire", || {
        *mirror_panel.lock().unwrap() == 20.0
    });

    let mut main = Tree::new(classid::CONTAINER, Payload::Container);
    let main_root = main.root();
    main.set_property_msg(main_root, "//S_conn/srv", &v_double(33.0), Some("temp"));
    wait_until("panel to follow 33.0", || *mirror_panel.lock().unwrap() == 33.0);

    // Kill the connection's peer side. The client binding falls back to
    // unused but keeps its remote path.
    h_ep.terminate();
    std::thread::sleep(Duration::from_millis(300));

    // A change while the wire is down stays on the server.
    main.set_property_msg(main_root, "//S_conn/srv", &v_double(44.0), Some("temp"));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(*mirror_panel.lock().unwrap(), 33.0);

    // Restart the listener on the same port; the connection reconnects, the
    // client re-issues its bind, and the panel catches up.
    let (h_ep2, _) = EndPoint::spawn(&format!("127.0.0.1:{port}"), None).unwrap();
    wait_until("panel to catch up to 44.0 after rebind", || {
        *mirror_panel.lock().unwrap() == 44.0
    });

    h_ep2.terminate();
    h_conn.terminate();
    hc.terminate();
    hs.terminate();
}
