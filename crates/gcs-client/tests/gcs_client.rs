//! End-to-end client tests.
//!
//! Every scenario runs once per event-loop backend against an in-memory
//! store server on an ephemeral port. Callbacks run on the test thread
//! (the one calling `run`), so assertions inside them fail the test.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gcs_client::{new_event_loop, AsyncGcsClient, EventLoop, Fatal, GcsError, OpContext};
use gcs_core::{
    ClientId, ClientTableData, EventLoopKind, HeartbeatTableData, JobId, ObjectId,
    ObjectTableData, Record, SchedulingState, TaskId, TaskTableData, TaskTableTestAndUpdate,
};
use gcs_store::protocol::{Command, Outcome};
use gcs_store::{spawn_background, ServerHandle, StoreEngine};

const WATCHDOG: Duration = Duration::from_secs(10);

type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Field order is drop order: the client goes before its loop, and the
/// store outlives both.
struct Harness {
    client: AsyncGcsClient,
    event_loop: Arc<dyn EventLoop>,
    server: Option<ServerHandle>,
}

impl Harness {
    fn unattached(kind: EventLoopKind) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let server = spawn_background(StoreEngine::open_in_memory().unwrap(), "127.0.0.1:0").unwrap();
        let client = AsyncGcsClient::new();
        client.connect("127.0.0.1", server.port()).unwrap();
        Self {
            client,
            event_loop: new_event_loop(kind).unwrap(),
            server: Some(server),
        }
    }

    fn start(kind: EventLoopKind) -> Self {
        let harness = Self::unattached(kind);
        harness.client.attach(harness.loop_handle()).unwrap();
        harness
    }

    fn port(&self) -> u16 {
        self.server.as_ref().map(ServerHandle::port).unwrap()
    }

    fn loop_handle(&self) -> Arc<dyn EventLoop> {
        Arc::clone(&self.event_loop)
    }

    /// Another client on the same store and loop.
    fn peer(&self) -> AsyncGcsClient {
        let peer = AsyncGcsClient::new();
        peer.connect("127.0.0.1", self.port()).unwrap();
        peer.attach(self.loop_handle()).unwrap();
        peer
    }

    /// Run the loop until a callback stops it; fail if that takes too long.
    fn run(&self) {
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let flag = Arc::clone(&timed_out);
            let event_loop = self.loop_handle();
            self.event_loop.add_timer(
                WATCHDOG,
                Box::new(move || {
                    flag.store(true, Ordering::SeqCst);
                    event_loop.stop();
                }),
            )
        };
        self.event_loop.run();
        self.event_loop.cancel_timer(watchdog);
        assert!(!timed_out.load(Ordering::SeqCst), "event loop timed out");
    }

    fn stop_server(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
    }
}

fn local_record(client: &AsyncGcsClient) -> ClientTableData {
    ClientTableData {
        node_manager_address: "127.0.0.1".to_string(),
        ..client.client_table().local_client()
    }
}

fn managers(names: &[&str]) -> ObjectTableData {
    ObjectTableData {
        managers: names.iter().map(|n| n.to_string()).collect(),
    }
}

// ── Object table ───────────────────────────────────────────────────

fn object_add_then_lookup(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let job = JobId::from_random();
    let object = ObjectId::from_random();
    let found = Arc::new(AtomicBool::new(false));

    let table = h.client.object_table().clone();
    let stop = h.loop_handle();
    let flag = Arc::clone(&found);
    h.client
        .object_table()
        .add(&job, &object, managers(&["A", "B"]), move |key, written| {
            assert_eq!(key, object);
            assert_eq!(written.managers, vec!["A", "B"]);
            table
                .lookup(
                    &job,
                    &object,
                    move |key, data| {
                        assert_eq!(key, object);
                        assert_eq!(data.managers, vec!["A", "B"]);
                        flag.store(true, Ordering::SeqCst);
                        stop.stop();
                    },
                    |_| panic!("record written just before must be found"),
                )
                .unwrap();
        })
        .unwrap();

    h.run();
    assert!(found.load(Ordering::SeqCst));
}

fn lookup_of_absent_key_reports_not_found_once(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let found = Arc::new(AtomicUsize::new(0));
    let missing = Arc::new(AtomicUsize::new(0));

    let object = ObjectId::from_random();
    let (f, m, stop) = (Arc::clone(&found), Arc::clone(&missing), h.loop_handle());
    h.client
        .object_table()
        .lookup(
            &JobId::from_random(),
            &object,
            move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            },
            move |key| {
                assert_eq!(key, object);
                m.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    // Replies come back in request order; this one trails the lookup.
    h.client
        .connection()
        .request(
            Command::Ping,
            OpContext::new("ping"),
            Box::new(move |_: Outcome| {
                stop.stop();
                Ok(())
            }),
        )
        .unwrap();

    h.run();
    assert_eq!(found.load(Ordering::SeqCst), 0);
    assert_eq!(missing.load(Ordering::SeqCst), 1);
}

fn lookup_all_reads_one_scope(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let job = JobId::from_random();
    let other_job = JobId::from_random();
    let table = h.client.object_table();

    let mut written: Vec<ObjectId> = (0..3).map(|_| ObjectId::from_random()).collect();
    for object in &written {
        table.add(&job, object, managers(&["A"]), |_, _| {}).unwrap();
    }
    table
        .add(&other_job, &ObjectId::from_random(), managers(&["Z"]), |_, _| {})
        .unwrap();

    let read = Arc::new(Mutex::new(Vec::new()));
    let (sink, stop) = (Arc::clone(&read), h.loop_handle());
    table
        .lookup_all(&job, move |records| {
            *sink.lock().unwrap() = records;
            stop.stop();
        })
        .unwrap();
    h.run();

    let read = read.lock().unwrap();
    let mut keys: Vec<ObjectId> = read.iter().map(|(key, _)| *key).collect();
    keys.sort();
    written.sort();
    assert_eq!(keys, written);
    assert!(read.iter().all(|(_, data)| data.managers == vec!["A"]));
}

// ── Heartbeat table ────────────────────────────────────────────────

fn heartbeat_round_trip(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let job = JobId::from_random();
    let client_id = ClientId::from_random();
    let beat = HeartbeatTableData::from_resources(client_id, [("CPU", 2.0, 4.0), ("GPU", 0.0, 1.0)])
        .unwrap();

    let table = h.client.heartbeat_table().clone();
    let stop = h.loop_handle();
    let expected = beat.clone();
    h.client
        .heartbeat_table()
        .add(&job, &client_id, beat, move |key, _| {
            table
                .lookup(
                    &job,
                    &key,
                    move |_, data| {
                        assert_eq!(data, expected);
                        assert_eq!(data.available()["CPU"], 2.0);
                        assert_eq!(data.total()["GPU"], 1.0);
                        stop.stop();
                    },
                    |_| panic!("heartbeat missing"),
                )
                .unwrap();
        })
        .unwrap();
    h.run();
}

// ── Task table ─────────────────────────────────────────────────────

fn scheduled_task(scheduler: ClientId) -> TaskTableData {
    TaskTableData {
        scheduling_state: SchedulingState::SCHEDULED,
        scheduler_id: scheduler,
    }
}

fn run_task_update(
    h: &Harness,
    owner: ClientId,
    candidate: ClientId,
) -> (Option<TaskTableData>, bool, TaskTableData) {
    let job = JobId::from_random();
    let task = TaskId::from_random();
    let result = Arc::new(Mutex::new(None));
    let table = h.client.task_table().clone();
    let stop = h.loop_handle();
    let sink = Arc::clone(&result);

    h.client
        .task_table()
        .add(&job, &task, scheduled_task(owner), move |_, _| {
            let update = TaskTableTestAndUpdate {
                test_scheduler_id: candidate,
                test_state_bitmask: SchedulingState::SCHEDULED,
                update_state: SchedulingState::LOST,
            };
            let reader = table.clone();
            table
                .test_and_update(&job, &task, update, move |key, data, applied| {
                    assert_eq!(key, task);
                    reader
                        .lookup(
                            &job,
                            &task,
                            move |_, stored| {
                                *sink.lock().unwrap() = Some((data, applied, stored));
                                stop.stop();
                            },
                            |_| panic!("task vanished"),
                        )
                        .unwrap();
                })
                .unwrap();
        })
        .unwrap();
    h.run();

    let outcome = result.lock().unwrap().take();
    outcome.unwrap()
}

fn task_update_applies_on_match(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let scheduler = ClientId::from_random();

    let (data, applied, stored) = run_task_update(&h, scheduler, scheduler);
    assert!(applied);
    assert_eq!(data.unwrap().scheduling_state, SchedulingState::LOST);
    assert_eq!(stored.scheduling_state, SchedulingState::LOST);
    assert_eq!(stored.scheduler_id, scheduler);
}

fn task_update_skips_other_scheduler(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let owner = ClientId::from_random();

    let (data, applied, stored) = run_task_update(&h, owner, ClientId::from_random());
    assert!(!applied);
    assert_eq!(data.unwrap(), scheduled_task(owner));
    assert_eq!(stored, scheduled_task(owner));
}

fn task_update_on_absent_task(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let seen = Arc::new(Mutex::new(None));
    let (sink, stop) = (Arc::clone(&seen), h.loop_handle());
    let update = TaskTableTestAndUpdate {
        test_scheduler_id: ClientId::nil(),
        test_state_bitmask: SchedulingState::SCHEDULED,
        update_state: SchedulingState::LOST,
    };
    h.client
        .task_table()
        .test_and_update(&JobId::from_random(), &TaskId::from_random(), update, move |_, data, applied| {
            *sink.lock().unwrap() = Some((data, applied));
            stop.stop();
        })
        .unwrap();
    h.run();

    assert_eq!(seen.lock().unwrap().take(), Some((None, false)));
}

// ── Subscriptions ──────────────────────────────────────────────────

fn subscribe_confirms_before_own_write(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let job = JobId::from_random();
    let object = ObjectId::from_random();
    let log: Log = Default::default();

    let (on_note, on_sub) = (Arc::clone(&log), Arc::clone(&log));
    h.client
        .object_table()
        .subscribe(
            &job,
            &ObjectId::nil(),
            move |key, data| {
                assert_eq!(key, object);
                assert_eq!(data.managers, vec!["A", "B"]);
                push(&on_note, "notification");
            },
            move || push(&on_sub, "subscribed"),
        )
        .unwrap();

    // Submitted in the same turn as the subscribe, before any reply.
    let (on_done, stop) = (Arc::clone(&log), h.loop_handle());
    h.client
        .object_table()
        .add(&job, &object, managers(&["A", "B"]), move |_, _| {
            push(&on_done, "added");
            stop.stop();
        })
        .unwrap();

    h.run();
    assert_eq!(entries(&log), vec!["subscribed", "notification", "added"]);
}

fn subscribe_filter_selects_one_key(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let job = JobId::from_random();
    let wanted = ObjectId::from_random();
    let other = ObjectId::from_random();
    let log: Log = Default::default();

    let note = Arc::clone(&log);
    let table = h.client.object_table().clone();
    let stop = h.loop_handle();
    h.client
        .object_table()
        .subscribe(
            &job,
            &wanted,
            move |key, _| push(&note, format!("notified {key}")),
            move || {
                table.add(&job, &other, managers(&["X"]), |_, _| {}).unwrap();
                table
                    .add(&job, &wanted, managers(&["Y"]), move |_, _| stop.stop())
                    .unwrap();
            },
        )
        .unwrap();

    h.run();
    assert_eq!(entries(&log), vec![format!("notified {wanted}")]);
}

fn unsubscribe_stops_notifications(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let job = JobId::from_random();
    let notifications = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&notifications);
    let table = h.client.object_table().clone();
    let stop = h.loop_handle();
    h.client
        .object_table()
        .subscribe(
            &job,
            &ObjectId::nil(),
            move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                let again = table.clone();
                table
                    .add(&job, &ObjectId::from_random(), managers(&["A"]), move |_, _| {
                        again.unsubscribe(&job).unwrap();
                        again
                            .add(&job, &ObjectId::from_random(), managers(&["B"]), move |_, _| {
                                stop.stop()
                            })
                            .unwrap();
                    })
                    .unwrap();
            },
        )
        .unwrap();

    h.run();
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

fn second_subscription_skips_earlier_writes(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let job = JobId::from_random();
    let before = ObjectId::from_random();
    let after = ObjectId::from_random();
    let log: Log = Default::default();

    let first = Arc::clone(&log);
    let table = h.client.object_table().clone();
    let stop = h.loop_handle();
    let on_first_ack = {
        let log = Arc::clone(&log);
        move || {
            table.add(&job, &before, managers(&["A"]), |_, _| {}).unwrap();
            let second = Arc::clone(&log);
            let writer = table.clone();
            table
                .subscribe(
                    &job,
                    &ObjectId::nil(),
                    move |key, _| push(&second, format!("second {key}")),
                    move || {
                        writer
                            .add(&job, &after, managers(&["B"]), move |_, _| stop.stop())
                            .unwrap();
                    },
                )
                .unwrap();
        }
    };
    h.client
        .object_table()
        .subscribe(
            &job,
            &ObjectId::nil(),
            move |key, _| push(&first, format!("first {key}")),
            on_first_ack,
        )
        .unwrap();

    h.run();
    assert_eq!(
        entries(&log),
        vec![
            format!("first {before}"),
            format!("first {after}"),
            format!("second {after}"),
        ]
    );
}

fn resubscribe_after_unsubscribe_sees_only_new_writes(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let job = JobId::from_random();
    let in_flight = ObjectId::from_random();
    let fresh = ObjectId::from_random();
    let log: Log = Default::default();

    let old = Arc::clone(&log);
    let table = h.client.object_table().clone();
    let stop = h.loop_handle();
    let on_first_ack = {
        let log = Arc::clone(&log);
        move || {
            // Published to this connection before the store sees the
            // unsubscribe, so its message is still in flight.
            table.add(&job, &in_flight, managers(&["A"]), |_, _| {}).unwrap();
            table.unsubscribe(&job).unwrap();
            let renewed = Arc::clone(&log);
            let writer = table.clone();
            table
                .subscribe(
                    &job,
                    &ObjectId::nil(),
                    move |key, _| push(&renewed, format!("renewed {key}")),
                    move || {
                        writer
                            .add(&job, &fresh, managers(&["B"]), move |_, _| stop.stop())
                            .unwrap();
                    },
                )
                .unwrap();
        }
    };
    h.client
        .object_table()
        .subscribe(
            &job,
            &ObjectId::nil(),
            move |key, _| push(&old, format!("old {key}")),
            on_first_ack,
        )
        .unwrap();

    h.run();
    assert_eq!(entries(&log), vec![format!("renewed {fresh}")]);
}

fn requests_before_attach_are_queued(kind: EventLoopKind) {
    let h = Harness::unattached(kind);
    let job = JobId::from_random();
    let log: Log = Default::default();

    let (on_note, on_sub, on_done) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
    let stop = h.loop_handle();
    let table = h.client.object_table();
    table
        .subscribe(
            &job,
            &ObjectId::nil(),
            move |_, _| push(&on_note, "notification"),
            move || push(&on_sub, "subscribed"),
        )
        .unwrap();
    table
        .add(&job, &ObjectId::from_random(), managers(&["A"]), move |_, _| {
            push(&on_done, "added");
            stop.stop();
        })
        .unwrap();
    assert!(entries(&log).is_empty());

    h.client.attach(h.loop_handle()).unwrap();
    h.run();
    assert_eq!(entries(&log), vec!["subscribed", "notification", "added"]);
}

// ── Client table ───────────────────────────────────────────────────

fn connect_observes_own_insertion(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let client_table = h.client.client_table().clone();
    let local_id = client_table.local_client_id();

    let (reader, stop) = (client_table.clone(), h.loop_handle());
    client_table.register_client_added_callback(move |id, data| {
        assert_eq!(id, local_id);
        assert!(data.is_insertion);
        let cached = reader.get_client(&local_id);
        assert!(cached.is_insertion);
        assert_eq!(cached.node_manager_address, "127.0.0.1");
        stop.stop();
    });
    client_table.connect(local_record(&h.client)).unwrap();
    h.run();

    let registered = client_table.local_client();
    assert_eq!(registered.client_id, local_id);
    assert_eq!(registered.node_manager_address, "127.0.0.1");
    assert_eq!(client_table.clients().len(), 1);
}

fn connect_then_disconnect_orders_events(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let client_table = h.client.client_table().clone();
    let local_id = client_table.local_client_id();
    let log: Log = Default::default();

    for n in 1..=2 {
        let added = Arc::clone(&log);
        client_table.register_client_added_callback(move |id, _| push(&added, format!("added{n} {id}")));
    }
    for n in 1..=2 {
        let removed = Arc::clone(&log);
        let stop = h.loop_handle();
        client_table.register_client_removed_callback(move |id, data| {
            assert!(!data.is_insertion);
            push(&removed, format!("removed{n} {id}"));
            if n == 2 {
                stop.stop();
            }
        });
    }

    client_table.connect(local_record(&h.client)).unwrap();
    client_table.disconnect().unwrap();
    h.run();

    assert_eq!(
        entries(&log),
        vec![
            format!("added1 {local_id}"),
            format!("added2 {local_id}"),
            format!("removed1 {local_id}"),
            format!("removed2 {local_id}"),
        ]
    );
    assert!(!client_table.get_client(&local_id).is_insertion);
}

fn members_see_each_other(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let peer = h.peer();
    let events = Arc::new(AtomicUsize::new(0));
    let seen: Arc<Mutex<Vec<(ClientId, ClientId)>>> = Default::default();

    for client in [&h.client, &peer] {
        let observer = client.client_table().local_client_id();
        let (events, seen, stop) = (Arc::clone(&events), Arc::clone(&seen), h.loop_handle());
        client.client_table().register_client_added_callback(move |id, _| {
            seen.lock().unwrap().push((observer, id));
            if events.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                stop.stop();
            }
        });
    }
    h.client.client_table().connect(local_record(&h.client)).unwrap();
    peer.client_table().connect(local_record(&peer)).unwrap();
    h.run();

    let a = h.client.client_table().local_client_id();
    let b = peer.client_table().local_client_id();
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    let mut expected = vec![(a, a), (a, b), (b, a), (b, b)];
    expected.sort();
    assert_eq!(seen, expected);
    assert!(h.client.client_table().get_client(&b).is_insertion);
    assert!(peer.client_table().get_client(&a).is_insertion);
}

fn second_client_connect_is_rejected(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let client_table = h.client.client_table();
    client_table.connect(local_record(&h.client)).unwrap();
    assert!(matches!(
        client_table.connect(local_record(&h.client)),
        Err(GcsError::ClientAlreadyConnected)
    ));
}

// ── Faults ─────────────────────────────────────────────────────────

fn record_faults(h: &Harness) -> Arc<Mutex<Vec<Fatal>>> {
    let faults: Arc<Mutex<Vec<Fatal>>> = Default::default();
    let (sink, stop) = (Arc::clone(&faults), h.loop_handle());
    h.client.set_fatal_handler(Arc::new(move |fatal: &Fatal| {
        sink.lock().unwrap().push(fatal.clone());
        stop.stop();
    }));
    faults
}

fn store_loss_is_fatal(kind: EventLoopKind) {
    let mut h = Harness::start(kind);
    let faults = record_faults(&h);

    h.stop_server();
    h.run();

    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].context.op, "connection");
}

fn undecodable_record_is_fatal(kind: EventLoopKind) {
    let h = Harness::start(kind);
    let faults = record_faults(&h);
    let job = JobId::from_random();
    let object = ObjectId::from_random();

    h.client
        .connection()
        .request(
            Command::Set {
                key: ObjectTableData::TABLE.key(&job, &object),
                value: b"not a record".to_vec(),
                publish: None,
            },
            OpContext::new("raw set"),
            Box::new(|_: Outcome| Ok(())),
        )
        .unwrap();
    h.client
        .object_table()
        .lookup(&job, &object, |_, _| panic!("garbage decoded"), |_| panic!("record exists"))
        .unwrap();
    h.run();

    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].context.op, "lookup");
    assert_eq!(faults[0].context.key, Some(object.hex()));
    assert!(faults[0].reason.contains("OBJECT"));
}

fn second_attach_is_rejected(kind: EventLoopKind) {
    let h = Harness::start(kind);
    assert!(matches!(
        h.client.attach(h.loop_handle()),
        Err(GcsError::AlreadyAttached)
    ));
}

macro_rules! on_both_backends {
    ($($scenario:ident),* $(,)?) => {
        mod mini_loop {
            $(
                #[test]
                fn $scenario() {
                    super::$scenario(gcs_core::EventLoopKind::Mini);
                }
            )*
        }

        mod tokio_loop {
            $(
                #[test]
                fn $scenario() {
                    super::$scenario(gcs_core::EventLoopKind::Tokio);
                }
            )*
        }
    };
}

on_both_backends!(
    object_add_then_lookup,
    lookup_of_absent_key_reports_not_found_once,
    lookup_all_reads_one_scope,
    heartbeat_round_trip,
    task_update_applies_on_match,
    task_update_skips_other_scheduler,
    task_update_on_absent_task,
    subscribe_confirms_before_own_write,
    subscribe_filter_selects_one_key,
    unsubscribe_stops_notifications,
    second_subscription_skips_earlier_writes,
    resubscribe_after_unsubscribe_sees_only_new_writes,
    requests_before_attach_are_queued,
    connect_observes_own_insertion,
    connect_then_disconnect_orders_events,
    members_see_each_other,
    second_client_connect_is_rejected,
    store_loss_is_fatal,
    undecodable_record_is_fatal,
    second_attach_is_rejected,
);

#[test]
fn operations_before_connect_fail() {
    let client = AsyncGcsClient::new();
    assert!(matches!(
        client.task_table().lookup(&JobId::nil(), &TaskId::nil(), |_, _| {}, |_| {}),
        Err(GcsError::NotConnected)
    ));
    assert!(matches!(
        client.client_table().connect(local_record(&client)),
        Err(GcsError::NotConnected)
    ));
}

#[test]
fn unreachable_store_is_a_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = AsyncGcsClient::new();
    assert!(matches!(
        client.connect("127.0.0.1", port),
        Err(GcsError::Connection { .. })
    ));
}
