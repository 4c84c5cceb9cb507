//! End-to-end scenarios against a bare `Core`, exercising the lettered
//! cases directly rather than through the full threaded `Bus`, since
//! `Core`'s methods are synchronous and the scheduler/connection-manager
//! threads add nothing but timing to these particular checks.

use evbus_core::queue::{QueueReceiver, QueueSender};
use evbus_core::{BusConfig, ClientRequest, Datagram, PoolConfig, Service};
use evbus_server::Core;
use mio::net::TcpStream as MioTcpStream;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};

static TAG_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_tag(case: &str) -> String {
    format!(
        "evbus-test-{}-{}-{}",
        std::process::id(),
        case,
        TAG_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn config(tag: &str, nev: u32, ntr: u32, nq: u32, max_clients: usize) -> BusConfig {
    BusConfig {
        tag: tag.to_owned(),
        pool: PoolConfig {
            event_buffers: nev,
            transition_buffers: ntr,
            buffer_size: 4096,
            partitions: nq,
        },
        max_clients,
        unlink_on_shutdown: true,
    }
}

/// A loopback TCP pair standing in for an accepted consumer connection:
/// `server` is what `ConnectionManager` would hand to `Core`, `client` is
/// what the consumer's runtime would read from.
fn transition_socket_pair() -> (MioTcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (MioTcpStream::from_std(server), client)
}

fn read_buffer_msg(stream: &mut TcpStream) -> evbus_core::BufferMsg {
    let mut buf = [0u8; evbus_core::BufferMsg::WIRE_SIZE];
    stream.read_exact(&mut buf).expect("expected a transition token");
    evbus_core::BufferMsg::from_bytes(&buf).unwrap()
}

/// Scenario (a): two consumers sharing one partition see every transition
/// and round-robin across event buffers.
#[test]
fn scenario_a_transition_sequence_and_round_robin() {
    let tag = unique_tag("a");
    let mut core = Core::new(&config(&tag, 4, 16, 2, 2), test_logger()).unwrap();

    let (a_sock, mut a_client) = transition_socket_pair();
    let (b_sock, mut b_client) = transition_socket_pair();
    let a_id = core.register_consumer(ClientRequest::Partition(0), a_sock).unwrap();
    let b_id = core.register_consumer(ClientRequest::Partition(0), b_sock).unwrap();

    // Both consumers must bind their event-input queues before the
    // producer can deliver to them, exactly as ConsumerRuntime::attach does.
    let a_in = QueueReceiver::bind(&evbus_core::names::event_input_queue(&tag, a_id), 8, &test_logger()).unwrap();
    let b_in = QueueReceiver::bind(&evbus_core::names::event_input_queue(&tag, b_id), 8, &test_logger()).unwrap();

    for service in [Service::Map, Service::Configure] {
        core.submit_transition(Datagram::new(service, Vec::new())).unwrap();
        assert_eq!(read_buffer_msg(&mut a_client).buffer_count as u32, 16);
        assert_eq!(read_buffer_msg(&mut b_client).buffer_count as u32, 16);
    }

    let mut deliveries = Vec::new();
    for _ in 0..4 {
        let b = core.acquire_event_token().expect("pool has 4 free tokens");
        core.shuffle_distribute(b, Datagram::new(Service::L1Accept, vec![0u8; 8])).unwrap();
        let from_a = a_in.try_recv().unwrap();
        let from_b = b_in.try_recv().unwrap();
        deliveries.push(match (from_a, from_b) {
            (Some(_), None) => 'A',
            (None, Some(_)) => 'B',
            other => panic!("expected exactly one destination, got {:?}", other),
        });
    }
    assert_eq!(deliveries, vec!['A', 'B', 'A', 'B']);

    for service in [Service::Disable, Service::Unconfigure, Service::Unmap] {
        core.submit_transition(Datagram::new(service, Vec::new())).unwrap();
        let _ = read_buffer_msg(&mut a_client);
        let _ = read_buffer_msg(&mut b_client);
    }
}

/// Scenario (b): a late joiner must receive the currently-open transitions,
/// in order, before any `L1Accept`.
#[test]
fn scenario_b_late_join_replays_open_transitions() {
    let tag = unique_tag("b");
    let mut core = Core::new(&config(&tag, 4, 16, 1, 2), test_logger()).unwrap();

    let (a_sock, mut a_client) = transition_socket_pair();
    let a_id = core.register_consumer(ClientRequest::Serial, a_sock).unwrap();
    let _a_in = QueueReceiver::bind(&evbus_core::names::event_input_queue(&tag, a_id), 8, &test_logger()).unwrap();

    for service in [Service::Map, Service::Configure] {
        core.submit_transition(Datagram::new(service, Vec::new())).unwrap();
        let _ = read_buffer_msg(&mut a_client);
    }

    let (b_sock, mut b_client) = transition_socket_pair();
    let b_id = core.register_consumer(ClientRequest::Serial, b_sock).unwrap();
    let _b_in = QueueReceiver::bind(&evbus_core::names::event_input_queue(&tag, b_id), 8, &test_logger()).unwrap();
    core.replay_initial(b_id);

    let replayed_map = read_buffer_msg(&mut b_client);
    let replayed_configure = read_buffer_msg(&mut b_client);
    assert_eq!(replayed_map.buffer_index, 4 + 0);
    assert_eq!(replayed_configure.buffer_index, 4 + 1);
}

/// Scenario (c): a crashed consumer's held buffers are fully reclaimed and
/// its transition-cache bits are cleared.
#[test]
fn scenario_c_retirement_reclaims_everything() {
    let tag = unique_tag("c");
    let mut core = Core::new(&config(&tag, 4, 16, 1, 2), test_logger()).unwrap();

    let (a_sock, _a_client) = transition_socket_pair();
    let (b_sock, _b_client) = transition_socket_pair();
    let a_id = core.register_consumer(ClientRequest::Partition(0), a_sock).unwrap();
    let b_id = core.register_consumer(ClientRequest::Partition(0), b_sock).unwrap();
    let _a_in = QueueReceiver::bind(&evbus_core::names::event_input_queue(&tag, a_id), 8, &test_logger()).unwrap();
    let _b_in = QueueReceiver::bind(&evbus_core::names::event_input_queue(&tag, b_id), 8, &test_logger()).unwrap();

    core.submit_transition(Datagram::new(Service::Map, Vec::new())).unwrap();
    core.submit_transition(Datagram::new(Service::Configure, Vec::new())).unwrap();

    let b0 = core.acquire_event_token().unwrap();
    core.shuffle_distribute(b0, Datagram::new(Service::L1Accept, Vec::new())).unwrap();
    let b1 = core.acquire_event_token().unwrap();
    core.shuffle_distribute(b1, Datagram::new(Service::L1Accept, Vec::new())).unwrap();

    // b1 went to b_id (round-robin's second turn). Return it through b's
    // event-output queue before retiring, the way ConsumerRuntime does on
    // a graceful release, so retirement has to drain it rather than rely
    // solely on the dest sweep.
    let b_return = QueueSender::connect(&evbus_core::names::event_output_queue(&tag, b_id)).unwrap();
    let returned_msg = evbus_core::BufferMsg::new(b1 as i32, 4, 4096, evbus_core::Mode::Serial);
    assert!(b_return.try_send(&returned_msg).unwrap());

    core.retire_consumer(b_id);

    // b1 must be reclaimed exactly once: the event-return drain clears
    // dest[b1] as it collects it, so the dest sweep that follows must not
    // also push it onto free_tokens a second time.
    let mut recovered = Vec::new();
    while let Some(b) = core.acquire_event_token() {
        recovered.push(b);
        if recovered.len() > 4 {
            break;
        }
    }
    let b1_count = recovered.iter().filter(|&&b| b == b1).count();
    assert_eq!(b1_count, 1, "b1 must be reclaimed exactly once, not duplicated");
    assert!(recovered.len() >= 1, "retirement must free at least the buffers b held");
    assert!(core.transitions.current_stack_copy().len() <= 2);
}

/// Scenario (d): an oversize datagram is a fatal, reported error and never
/// touches the transition cache.
#[test]
fn scenario_d_oversize_datagram_is_fatal() {
    let tag = unique_tag("d");
    let mut core = Core::new(&config(&tag, 4, 16, 1, 1), test_logger()).unwrap();

    let huge = vec![0u8; 4096 + 1];
    let result = core.submit_transition(Datagram::new(Service::Configure, huge));
    assert!(matches!(result, Err(evbus_core::Error::OversizeDatagram { .. })));
    assert!(core.transitions.current_stack_copy().is_empty());
}

/// Scenario (e): a full partition member is skipped in favor of the next
/// live member in the round-robin.
#[test]
fn scenario_e_full_member_is_skipped() {
    let tag = unique_tag("e");
    let mut core = Core::new(&config(&tag, 4, 16, 1, 2), test_logger()).unwrap();

    let (a_sock, _a_client) = transition_socket_pair();
    let (b_sock, _b_client) = transition_socket_pair();
    let a_id = core.register_consumer(ClientRequest::Partition(0), a_sock).unwrap();
    let b_id = core.register_consumer(ClientRequest::Partition(0), b_sock).unwrap();

    // `a`'s queue is bound with the smallest capacity the transport allows
    // and pumped to saturation, so the next send to it must fail and fall
    // through to `b` -- the kernel may round the requested buffer size up,
    // so fill it by trying sends until one is actually refused rather than
    // assuming a fixed message count.
    let a_in = QueueReceiver::bind(&evbus_core::names::event_input_queue(&tag, a_id), 1, &test_logger()).unwrap();
    let b_in = QueueReceiver::bind(&evbus_core::names::event_input_queue(&tag, b_id), 1, &test_logger()).unwrap();
    let filler = QueueSender::connect(&evbus_core::names::event_input_queue(&tag, a_id)).unwrap();
    let filler_msg = evbus_core::BufferMsg::new(0, 4, 4096, evbus_core::Mode::Serial);
    let mut primed = 0;
    while filler.try_send(&filler_msg).unwrap() {
        primed += 1;
        assert!(primed < 200_000, "queue never reported full");
    }

    let b_buf = core.acquire_event_token().unwrap();
    core.shuffle_distribute(b_buf, Datagram::new(Service::L1Accept, Vec::new())).unwrap();

    assert!(b_in.try_recv().unwrap().is_some(), "b must receive the redirected event");
    // Drain exactly `primed` filler messages back out of a's queue; no
    // (primed + 1)-th message should be sitting behind them.
    for _ in 0..primed {
        assert!(a_in.try_recv().unwrap().is_some());
    }
    assert!(a_in.try_recv().unwrap().is_none());
}

/// Scenario (f): nested `BeginCalibCycle`/`EndCalibCycle` pairs never push
/// the live stack past the run's actual nesting depth.
#[test]
fn scenario_f_nested_calib_cycles_bounded_depth() {
    let tag = unique_tag("f");
    let mut core = Core::new(&config(&tag, 4, 16, 1, 1), test_logger()).unwrap();

    let (a_sock, mut a_client) = transition_socket_pair();
    let a_id = core.register_consumer(ClientRequest::Serial, a_sock).unwrap();
    let _a_in = QueueReceiver::bind(&evbus_core::names::event_input_queue(&tag, a_id), 8, &test_logger()).unwrap();

    let sequence = [
        Service::Map,
        Service::Configure,
        Service::BeginRun,
        Service::BeginCalibCycle,
        Service::EndCalibCycle,
        Service::BeginCalibCycle,
        Service::EndCalibCycle,
    ];
    let mut max_depth = 0;
    for service in sequence {
        core.submit_transition(Datagram::new(service, Vec::new())).unwrap();
        let _ = read_buffer_msg(&mut a_client);
        max_depth = max_depth.max(core.transitions.current_stack_copy().len());
    }
    assert!(max_depth <= 4, "stack depth {} exceeds the run's nesting", max_depth);
}
