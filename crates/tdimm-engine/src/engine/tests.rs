use super::*;
use crate::hal::Opcode;
use crate::request::{ControlOp, IoBuf, RequestFlags};
use crate::sim::{FaultKind, FaultRule, FaultTarget, SimConfig, SimControl, SimHal};
use parking_lot::Mutex;
use rand::Rng;
use std::time::Duration;
use tdimm_common::{CollisionMode, Direction, IoResult};

type Outcome = Arc<Mutex<Option<IoResult>>>;

fn tracked(request: Request) -> (Request, Outcome) {
    let outcome: Outcome = Arc::new(Mutex::new(None));
    let o = Arc::clone(&outcome);
    (request.on_complete(move |res, _| *o.lock() = Some(res)), outcome)
}

fn small_config(tokens: usize) -> EngineConfig {
    EngineConfig {
        name: "t".into(),
        token_count: tokens,
        core_buffers: tokens,
        write_buffers: tokens,
        read_buffers: tokens,
        max_burst: u32::try_from(tokens).unwrap(),
        ..EngineConfig::default()
    }
}

fn running(config: EngineConfig, sim: SimConfig) -> (Engine, SimControl) {
    let (hal, control) = SimHal::new(sim);
    let mut engine = Engine::new(config, Box::new(hal)).unwrap();
    engine.start().unwrap();
    drive(&mut engine);
    assert_eq!(engine.state(), RunState::Running);
    (engine, control)
}

fn drive(engine: &mut Engine) {
    for _ in 0..10_000 {
        if !engine.poll_once() {
            return;
        }
    }
    panic!("engine never went idle: {engine:?}");
}

fn run_until(engine: &mut Engine, done: impl Fn(&Engine) -> bool) {
    for _ in 0..5_000 {
        engine.poll_once();
        if done(engine) {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("condition never reached: {engine:?}");
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

fn started_lbas(control: &SimControl, from: usize, opcode: Opcode) -> Vec<u64> {
    control.started()[from..]
        .iter()
        .filter(|c| c.opcode == opcode)
        .map(|c| c.lba)
        .collect()
}

#[test]
fn test_start_purges_stale_read_buffers() {
    let (engine, control) = running(
        small_config(4),
        SimConfig {
            read_buffers: 4,
            ..SimConfig::default()
        },
    );
    assert_eq!(control.held_read_buffers(), 0);
    assert_eq!(control.counters().deallocs, 4);
    assert_eq!(control.counters().spurious_deallocs, 0);
    assert_eq!(engine.read_bufs.free_count(), 4);
}

#[test]
fn test_failed_handshake_kills_engine() {
    let (hal, control) = SimHal::new(SimConfig::default());
    control.fail_handshake(true);
    let mut engine = Engine::new(EngineConfig::default(), Box::new(hal)).unwrap();
    assert!(engine.start().is_err());
    assert_eq!(engine.state(), RunState::Dead);
    engine.reset().unwrap();
    assert_eq!(engine.state(), RunState::Init);
}

#[test]
fn test_four_fragment_write_dispatches_in_one_pass() {
    let (mut engine, control) = running(small_config(4), SimConfig::default());
    let handle = engine.handle();
    control.stall(24, 8);

    let (req, done) = tracked(Request::write(0, IoBuf::from_vec(vec![7u8; 16384])));
    handle.queue_request(req);
    let before = control.started().len();
    assert_eq!(engine.io_begin(), 4);
    assert_eq!(started_lbas(&control, before, Opcode::Write), vec![0, 8, 16, 24]);

    engine.io_complete(None);
    assert_eq!(*done.lock(), None);
    assert_eq!(engine.tokens().in_use(), 1);

    control.release();
    engine.io_complete(None);
    assert_eq!(*done.lock(), Some(Ok(())));
    assert_eq!(control.read_media(0, 16384), vec![7u8; 16384]);
    assert_eq!(engine.stats().fragments, 4);
}

#[test]
fn test_short_on_tokens_dispatches_nothing() {
    let (mut engine, control) = running(small_config(4), SimConfig::default());
    let handle = engine.handle();
    control.stall(1024, 16);
    handle.queue_request(Request::read(1024 * 512, IoBuf::zeroed(4096)));
    handle.queue_request(Request::read(1032 * 512, IoBuf::zeroed(4096)));
    assert_eq!(engine.io_begin(), 2);

    let before = control.started().len();
    let (write, done) = tracked(Request::write(0, IoBuf::zeroed(16384)));
    let (later, later_done) = tracked(Request::write(65536, IoBuf::zeroed(4096)));
    handle.queue_request(write);
    handle.queue_request(later);
    let requeues = engine.stats().requeues;
    assert_eq!(engine.io_begin(), 0);
    assert_eq!(engine.queued_len(), 2);
    assert_eq!(engine.stats().requeues, requeues + 1);
    assert_eq!(control.started().len(), before);

    control.release();
    drive(&mut engine);
    assert_eq!(*done.lock(), Some(Ok(())));
    assert_eq!(*later_done.lock(), Some(Ok(())));
    assert_eq!(started_lbas(&control, before, Opcode::Write), vec![0, 8, 16, 24, 128]);
    engine.check_invariants().unwrap();
}

#[test]
fn test_dual_write_survives_dead_copy() {
    let config = EngineConfig {
        sec_copies: 2,
        timeout_ms: 1,
        ..small_config(8)
    };
    let (mut engine, control) = running(config, SimConfig::default());
    control.inject(FaultRule::new(FaultTarget::Lba(0), FaultKind::DeadTimeout, 1).after(1));

    let (req, done) = tracked(Request::write(0, IoBuf::from_vec(vec![9u8; 4096])));
    engine.handle().queue_request(req);
    run_until(&mut engine, |_| done.lock().is_some());

    assert_eq!(*done.lock(), Some(Ok(())));
    assert_eq!(engine.state(), RunState::Running);
    assert_eq!(engine.stats().timeouts, 1);
    assert_eq!(engine.tokens().in_use(), 0);
    assert_eq!(control.read_media(0, 4096), vec![9u8; 4096]);
}

#[test]
fn test_dual_write_suppresses_retry_after_commit() {
    let config = EngineConfig {
        sec_copies: 2,
        timeout_ms: 1,
        ..small_config(8)
    };
    let (mut engine, control) = running(config, SimConfig::default());
    control.inject(FaultRule::new(FaultTarget::Lba(8), FaultKind::Timeout, 1).after(1));

    let (req, done) = tracked(Request::write(4096, IoBuf::from_vec(vec![3u8; 4096])));
    engine.handle().queue_request(req);
    run_until(&mut engine, |_| done.lock().is_some());

    assert_eq!(*done.lock(), Some(Ok(())));
    assert_eq!(engine.stats().sec_suppressed, 1);
    assert_eq!(engine.stats().retries, 0);
    assert_eq!(engine.state(), RunState::Running);
}

#[test]
fn test_dual_write_losing_every_copy_is_fatal() {
    let config = EngineConfig {
        sec_copies: 2,
        timeout_ms: 1,
        ..small_config(8)
    };
    let (mut engine, control) = running(config, SimConfig::default());
    control.inject(FaultRule::new(FaultTarget::Lba(0), FaultKind::DeadTimeout, 2));

    let (req, done) = tracked(Request::write(0, IoBuf::zeroed(4096)));
    engine.handle().queue_request(req);
    run_until(&mut engine, |e| e.state() == RunState::Dead);
    assert_eq!(*done.lock(), Some(Err(IoError::Timeout)));
}

#[test]
fn test_retry_budget_is_exact() {
    let config = EngineConfig {
        max_retries: 3,
        ..small_config(4)
    };
    let (mut engine, control) = running(config, SimConfig::default());
    control.inject(FaultRule::new(FaultTarget::Lba(64), FaultKind::Retryable, 100));
    let before = control.started().len();

    let (req, done) = tracked(Request::write(64 * 512, IoBuf::zeroed(4096)));
    engine.handle().queue_request(req);
    drive(&mut engine);

    assert_eq!(*done.lock(), Some(Err(IoError::Io)));
    assert_eq!(started_lbas(&control, before, Opcode::Write), vec![64; 4]);
    assert_eq!(engine.stats().retries, 3);
    assert_eq!(control.counters().polarity_violations, 0);
    assert_eq!(engine.state(), RunState::Running);
}

#[test]
fn test_retry_recovers_within_budget() {
    let config = EngineConfig {
        max_retries: 3,
        ..small_config(4)
    };
    let (mut engine, control) = running(config, SimConfig::default());
    control.write_media(40 * 512, &pattern(4096, 1));
    control.inject(FaultRule::new(FaultTarget::Lba(40), FaultKind::Retryable, 3));

    let buf = IoBuf::zeroed(4096);
    let (req, done) = tracked(Request::read(40 * 512, buf.clone()));
    engine.handle().queue_request(req);
    drive(&mut engine);

    assert_eq!(*done.lock(), Some(Ok(())));
    assert_eq!(buf.to_vec(), pattern(4096, 1));
    assert_eq!(engine.stats().retries, 3);
    // every retry ran in a fresh read buffer
    assert_eq!(control.counters().double_allocations, 0);
    assert_eq!(control.counters().polarity_violations, 0);
}

#[test]
fn test_fatal_status_kills_engine() {
    let (mut engine, control) = running(small_config(4), SimConfig::default());
    let handle = engine.handle();
    control.stall(512, 8);
    control.inject(FaultRule::new(FaultTarget::Lba(0), FaultKind::Fatal, 1));

    let (read, read_done) = tracked(Request::read(512 * 512, IoBuf::zeroed(4096)));
    let (write, write_done) = tracked(Request::write(0, IoBuf::zeroed(4096)));
    handle.queue_request(read);
    handle.queue_request(write);
    engine.poll_once();
    engine.poll_once();

    assert_eq!(engine.state(), RunState::Dead);
    assert_eq!(*write_done.lock(), Some(Err(IoError::Io)));
    assert_eq!(*read_done.lock(), Some(Err(IoError::Io)));
    assert_eq!(engine.tokens().in_use(), 0);

    let (late, late_done) = tracked(Request::read(0, IoBuf::zeroed(4096)));
    handle.queue_request(late);
    assert_eq!(*late_done.lock(), Some(Err(IoError::Io)));

    engine.reset().unwrap();
    assert_eq!(engine.state(), RunState::Init);
}

#[test]
fn test_too_many_timeouts_terminate() {
    let config = EngineConfig {
        timeout_ms: 1,
        timeout_abort_threshold: 1,
        max_retries: 100,
        ..small_config(8)
    };
    let (mut engine, control) = running(config, SimConfig::default());
    control.inject(FaultRule::new(FaultTarget::Opcode(Opcode::Read), FaultKind::Timeout, 1000));

    let (a, a_done) = tracked(Request::read(0, IoBuf::zeroed(4096)));
    let (b, b_done) = tracked(Request::read(8192, IoBuf::zeroed(4096)));
    engine.handle().queue_request(a);
    engine.handle().queue_request(b);
    run_until(&mut engine, |e| e.state() == RunState::Dead);

    assert!(matches!(*a_done.lock(), Some(Err(_))));
    assert!(matches!(*b_done.lock(), Some(Err(_))));
    assert!(engine.stats().timeouts >= 2);
}

#[test]
fn test_partial_write_merges_page() {
    let (mut engine, control) = running(EngineConfig::default(), SimConfig::default());
    control.write_media(8192, &[0xAA; 4096]);

    let (req, done) = tracked(Request::write(8192 + 1024, IoBuf::from_vec(vec![0x55; 512])));
    engine.handle().queue_request(req);
    drive(&mut engine);

    assert_eq!(*done.lock(), Some(Ok(())));
    let page = control.read_media(8192, 4096);
    assert!(page[..1024].iter().all(|&b| b == 0xAA));
    assert!(page[1024..1536].iter().all(|&b| b == 0x55));
    assert!(page[1536..].iter().all(|&b| b == 0xAA));
    assert_eq!(engine.stats().rmw, 1);
    assert_eq!(control.counters().double_allocations, 0);
}

#[test]
fn test_unaligned_write_spans_pages() {
    let (mut engine, control) = running(EngineConfig::default(), SimConfig::default());
    control.write_media(0, &pattern(3 * 4096, 0));

    let data = vec![0xEE; 4096 + 2048];
    let (req, done) = tracked(Request::write(3072, IoBuf::from_vec(data)));
    engine.handle().queue_request(req);
    drive(&mut engine);

    assert_eq!(*done.lock(), Some(Ok(())));
    let mut expected = pattern(3 * 4096, 0);
    expected[3072..3072 + 6144].fill(0xEE);
    assert_eq!(control.read_media(0, 3 * 4096), expected);
    // head and tail pages need a merge, the middle one does not
    assert_eq!(engine.stats().rmw, 2);
}

#[test]
fn test_unaligned_read_spans_pages() {
    let (mut engine, control) = running(EngineConfig::default(), SimConfig::default());
    let media = pattern(3 * 4096, 5);
    control.write_media(0, &media);

    let buf = IoBuf::zeroed(4096 + 1024);
    let (req, done) = tracked(Request::read(3584, buf.clone()));
    engine.handle().queue_request(req);
    drive(&mut engine);

    assert_eq!(*done.lock(), Some(Ok(())));
    assert_eq!(buf.to_vec(), media[3584..3584 + 5120].to_vec());
    assert_eq!(engine.stats().bytes_read, 5120);
}

#[test]
fn test_deferred_extended_status() {
    let (mut engine, control) = running(EngineConfig::default(), SimConfig::default());
    control.write_media(0, &pattern(4096, 9));
    control.set_ext_delay(3);

    let buf = IoBuf::zeroed(4096);
    let (req, done) = tracked(Request::read(0, buf.clone()));
    engine.handle().queue_request(req);
    drive(&mut engine);

    assert_eq!(*done.lock(), Some(Ok(())));
    assert_eq!(buf.to_vec(), pattern(4096, 9));
}

#[test]
fn test_discard_zeroes_range() {
    let (mut engine, control) = running(EngineConfig::default(), SimConfig::default());
    let len = 256 * 1024;
    control.write_media(0, &vec![1u8; len]);

    let (start, size) = (4096u64, 204_800u64);
    let (req, done) = tracked(Request::discard(start, size));
    engine.handle().queue_request(req);
    drive(&mut engine);

    assert_eq!(*done.lock(), Some(Ok(())));
    // front piece, one stripe on each backend, back piece
    assert_eq!(control.counters().trims, 4);
    let media = control.read_media(0, len);
    let end = (start + size) as usize;
    assert!(media[..start as usize].iter().all(|&b| b == 1));
    assert!(media[start as usize..end].iter().all(|&b| b == 0));
    assert!(media[end..].iter().all(|&b| b == 1));
    assert_eq!(engine.stats().bytes_discarded, size);
}

#[test]
fn test_invalid_requests_rejected() {
    let (mut engine, _control) = running(EngineConfig::default(), SimConfig::default());
    let handle = engine.handle();
    let barrier = RequestFlags {
        barrier: true,
        ..RequestFlags::default()
    };
    let capacity = engine.geometry().capacity_bytes;
    let cases = [
        Request::new(Direction::Write, 0, 0).with_flags(barrier),
        Request::read(100, IoBuf::zeroed(512)),
        Request::read(capacity, IoBuf::zeroed(4096)),
        Request::write(0, IoBuf::zeroed(1024 * 1024)),
        Request::new(Direction::Write, 0, 4096),
    ];
    let outcomes: Vec<Outcome> = cases
        .into_iter()
        .map(|r| {
            let (r, o) = tracked(r);
            handle.queue_request(r);
            o
        })
        .collect();
    engine.io_begin();
    for outcome in outcomes {
        assert_eq!(*outcome.lock(), Some(Err(IoError::Invalid)));
    }
    assert_eq!(engine.tokens().in_use(), 0);
}

#[test]
fn test_barrier_runs_alone() {
    let (mut engine, control) = running(EngineConfig::default(), SimConfig::default());
    let handle = engine.handle();
    control.stall(0, 8);
    let barrier = RequestFlags {
        barrier: true,
        ..RequestFlags::default()
    };

    let (a, a_done) = tracked(Request::write(0, IoBuf::zeroed(4096)));
    let (b, b_done) = tracked(Request::write(8192, IoBuf::zeroed(4096)).with_flags(barrier));
    let (c, c_done) = tracked(Request::write(16384, IoBuf::zeroed(4096)));
    handle.queue_request(a);
    handle.queue_request(b);
    handle.queue_request(c);
    assert_eq!(engine.io_begin(), 1);
    assert_eq!(engine.queued_len(), 2);

    control.release();
    engine.io_complete(None);
    assert_eq!(*a_done.lock(), Some(Ok(())));
    assert_eq!(engine.io_begin(), 1);
    assert_eq!(engine.state(), RunState::SyncIo);
    assert_eq!(engine.queued_len(), 1);

    engine.io_complete(None);
    assert_eq!(*b_done.lock(), Some(Ok(())));
    assert_eq!(engine.state(), RunState::Running);
    assert_eq!(engine.io_begin(), 1);
    drive(&mut engine);
    assert_eq!(*c_done.lock(), Some(Ok(())));
}

#[test]
fn test_overlapping_read_waits_for_write() {
    let (mut engine, control) = running(EngineConfig::default(), SimConfig::default());
    let handle = engine.handle();
    control.stall(16, 8);

    let (w, w_done) = tracked(Request::write(8192, IoBuf::from_vec(vec![4u8; 4096])));
    let buf = IoBuf::zeroed(4096);
    let (r, r_done) = tracked(Request::read(8192, buf.clone()));
    handle.queue_request(w);
    handle.queue_request(r);
    assert_eq!(engine.io_begin(), 1);
    assert!(engine.stats().collisions >= 1);

    control.release();
    drive(&mut engine);
    assert_eq!(*w_done.lock(), Some(Ok(())));
    assert_eq!(*r_done.lock(), Some(Ok(())));
    assert_eq!(buf.to_vec(), vec![4u8; 4096]);
}

#[test]
fn test_collision_mode_none_lets_overlap_through() {
    let config = EngineConfig {
        collision_mode: CollisionMode::None,
        ..EngineConfig::default()
    };
    let (mut engine, control) = running(config, SimConfig::default());
    control.stall(0, 8);
    engine.handle().queue_request(Request::write(0, IoBuf::zeroed(4096)));
    engine.handle().queue_request(Request::read(0, IoBuf::zeroed(4096)));
    assert_eq!(engine.io_begin(), 2);
    control.release();
    drive(&mut engine);
}

#[test]
fn test_power_cycle_drains_and_resumes() {
    let (mut engine, control) = running(EngineConfig::default(), SimConfig::default());
    let handle = engine.handle();
    control.stall(0, 8);

    let (a, a_done) = tracked(Request::write(0, IoBuf::zeroed(4096)));
    handle.queue_request(a);
    assert_eq!(engine.io_begin(), 1);
    engine.request_state(RunState::PmDrain).unwrap();
    assert_eq!(engine.state(), RunState::PmDrain);

    let (b, b_done) = tracked(Request::write(8192, IoBuf::zeroed(4096)));
    handle.queue_request(b);
    engine.poll_once();
    assert_eq!(engine.queued_len(), 1);

    control.release();
    engine.poll_once();
    assert_eq!(*a_done.lock(), Some(Ok(())));
    assert_eq!(engine.state(), RunState::PmSleep);
    assert!(control.is_suspended());
    assert_eq!(*b_done.lock(), None);

    engine.resume().unwrap();
    assert_eq!(engine.state(), RunState::Running);
    drive(&mut engine);
    assert_eq!(*b_done.lock(), Some(Ok(())));
    assert!(engine.resume().is_err());
}

#[test]
fn test_control_commands_round_trip() {
    let (mut engine, _control) = running(EngineConfig::default(), SimConfig::default());
    let handle = engine.handle();
    let set = Arc::new(Mutex::new(None));
    let get = Arc::new(Mutex::new(None));
    let (s, g) = (Arc::clone(&set), Arc::clone(&get));
    handle.queue_control(ControlCommand::new(ControlOp::SetParam(7, 99), move |r| *s.lock() = Some(r)));
    handle.queue_control(ControlCommand::new(ControlOp::GetParam(7), move |r| *g.lock() = Some(r)));
    drive(&mut engine);

    assert_eq!(*set.lock(), Some(Ok(99)));
    assert_eq!(*get.lock(), Some(Ok(99)));
    assert_eq!(engine.stats().control_commands, 2);
}

#[test]
fn test_control_only_state_holds_block_io() {
    let (mut engine, _control) = running(EngineConfig::default(), SimConfig::default());
    let handle = engine.handle();
    engine.request_state(RunState::UcmdOnly).unwrap();

    let (w, w_done) = tracked(Request::write(0, IoBuf::zeroed(4096)));
    handle.queue_request(w);
    let nop = Arc::new(Mutex::new(None));
    let n = Arc::clone(&nop);
    handle.queue_control(ControlCommand::new(ControlOp::Nop, move |r| *n.lock() = Some(r)));
    for _ in 0..4 {
        engine.poll_once();
    }
    assert_eq!(*nop.lock(), Some(Ok(0)));
    assert_eq!(*w_done.lock(), None);

    engine.request_state(RunState::Running).unwrap();
    drive(&mut engine);
    assert_eq!(*w_done.lock(), Some(Ok(())));
}

#[test]
fn test_exhausted_command_consumes_sequence() {
    let config = EngineConfig {
        max_retries: 1,
        ..EngineConfig::default()
    };
    let sim = SimConfig {
        strict_sequence: true,
        ..SimConfig::default()
    };
    let (mut engine, control) = running(config, sim);
    control.inject(FaultRule::new(FaultTarget::Lba(8), FaultKind::Retryable, 10));

    let (a, a_done) = tracked(Request::write(0, IoBuf::zeroed(4096)));
    let (b, b_done) = tracked(Request::write(4096, IoBuf::zeroed(4096)));
    let (c, c_done) = tracked(Request::write(8192, IoBuf::zeroed(4096)));
    for r in [a, b, c] {
        engine.handle().queue_request(r);
    }
    drive(&mut engine);

    assert_eq!(*a_done.lock(), Some(Ok(())));
    assert_eq!(*b_done.lock(), Some(Err(IoError::Io)));
    assert_eq!(*c_done.lock(), Some(Ok(())));
    assert_eq!(control.counters().seq_advances, 1);
    assert_eq!(engine.stats().seq_advances, 1);
    assert_eq!(engine.state(), RunState::Running);
}

#[test]
fn test_handle_sees_internal_work() {
    let (hal, control) = SimHal::new(SimConfig {
        read_buffers: 4,
        ..SimConfig::default()
    });
    let mut engine = Engine::new(small_config(4), Box::new(hal)).unwrap();
    let handle = engine.handle();
    assert!(!handle.has_pending());

    engine.start().unwrap();
    assert_eq!(engine.state(), RunState::ReadPurge);
    assert!(handle.has_pending());
    drive(&mut engine);
    assert_eq!(engine.state(), RunState::Running);
    assert!(!handle.has_pending());

    control.refuse_suspend(1);
    engine.request_state(RunState::PmDrain).unwrap();
    assert_eq!(engine.state(), RunState::PmShutdown);
    assert!(handle.has_pending());
    engine.poll_once();
    assert_eq!(engine.state(), RunState::PmSleep);
    assert!(!handle.has_pending());
}

#[test]
fn test_piggybacked_deallocations() {
    let config = EngineConfig {
        independent_dealloc: false,
        ..small_config(4)
    };
    let sim = SimConfig {
        read_buffers: 4,
        ..SimConfig::default()
    };
    let (mut engine, control) = running(config, sim);
    assert_eq!(control.held_read_buffers(), 0);
    let media = pattern(12 * 4096, 3);
    control.write_media(0, &media);

    let reads: Vec<(IoBuf, Outcome)> = (0..12u64)
        .map(|i| {
            let buf = IoBuf::zeroed(4096);
            let (r, o) = tracked(Request::read(i * 4096, buf.clone()));
            engine.handle().queue_request(r);
            (buf, o)
        })
        .collect();
    drive(&mut engine);

    for (i, (buf, outcome)) in reads.iter().enumerate() {
        assert_eq!(*outcome.lock(), Some(Ok(())));
        assert_eq!(buf.to_vec(), media[i * 4096..(i + 1) * 4096].to_vec());
    }
    let counters = control.counters();
    assert_eq!(counters.double_allocations, 0);
    assert_eq!(counters.spurious_deallocs, 0);
    assert!(control.held_read_buffers() <= engine.read_bufs.total());
    assert_eq!(control.held_read_buffers(), engine.read_bufs.pending_deallocations());
    // Every read past the first pool's worth reused a buffer released by a
    // deallocation carried on a later command
    assert!(control.counters().deallocs >= 8);
}

#[test]
fn test_orphaned_read_buffer_recovered() {
    let config = EngineConfig {
        orphan_threshold_ms: 1,
        ..EngineConfig::default()
    };
    let (mut engine, _control) = running(config, SimConfig::default());
    let total = engine.read_bufs.total();
    engine.read_bufs.allocate(Instant::now()).unwrap();
    std::thread::sleep(Duration::from_millis(5));

    engine.io_begin();
    assert_eq!(engine.stats().orphans_recovered, 1);
    drive(&mut engine);
    assert_eq!(engine.read_bufs.free_count(), total);
}

#[test]
fn test_runtime_variables() {
    let (mut engine, _control) = running(EngineConfig::default(), SimConfig::default());
    engine.set_var(ConfigVar::MaxRetries, 7).unwrap();
    assert_eq!(engine.get_var(ConfigVar::MaxRetries), 7);
    assert!(engine.set_var(ConfigVar::TokenCount, 8).is_err());
    assert!(engine.set_var(ConfigVar::MaxBurst, 100_000).is_err());

    engine.set_var(ConfigVar::MaxRequestBytes, 4096).unwrap();
    let (req, done) = tracked(Request::read(0, IoBuf::zeroed(8192)));
    engine.handle().queue_request(req);
    engine.io_begin();
    assert_eq!(*done.lock(), Some(Err(IoError::Invalid)));
}

#[test]
fn test_random_workload_matches_model() {
    const CAPACITY: usize = 1 << 20;
    let config = EngineConfig {
        token_count: 16,
        core_buffers: 16,
        write_buffers: 8,
        read_buffers: 8,
        max_burst: 16,
        ..EngineConfig::default()
    };
    let sim = SimConfig {
        capacity_bytes: CAPACITY as u64,
        read_buffers: 8,
        write_buffers: 8,
        latency_polls: 1,
        ..SimConfig::default()
    };
    let (mut engine, control) = running(config, sim);
    let handle = engine.handle();
    let mut model = vec![0u8; CAPACITY];
    let mut reads = Vec::new();
    let mut writes = Vec::new();
    let mut rng = rand::thread_rng();

    for step in 0..400u32 {
        let sectors = rng.gen_range(1..=24u64);
        let size = sectors * 512;
        let offset = rng.gen_range(0..(CAPACITY as u64 - size) / 512) * 512;
        let (start, end) = (offset as usize, (offset + size) as usize);
        match rng.gen_range(0..10) {
            0..=3 => {
                let mut data = vec![0u8; size as usize];
                rng.fill(&mut data[..]);
                model[start..end].copy_from_slice(&data);
                let (r, o) = tracked(Request::write(offset, IoBuf::from_vec(data)));
                handle.queue_request(r);
                writes.push(o);
            }
            4 => {
                model[start..end].fill(0);
                let (r, o) = tracked(Request::discard(offset, size));
                handle.queue_request(r);
                writes.push(o);
            }
            _ => {
                let buf = IoBuf::zeroed(size as usize);
                let (r, o) = tracked(Request::read(offset, buf.clone()));
                handle.queue_request(r);
                reads.push((buf, model[start..end].to_vec(), o));
            }
        }
        if step % 3 == 0 {
            engine.poll_once();
            engine.check_invariants().unwrap();
        }
    }
    drive(&mut engine);
    engine.check_invariants().unwrap();

    for outcome in writes {
        assert_eq!(*outcome.lock(), Some(Ok(())));
    }
    for (buf, expected, outcome) in reads {
        assert_eq!(*outcome.lock(), Some(Ok(())));
        assert_eq!(buf.to_vec(), expected);
    }
    assert_eq!(engine.tokens().in_use(), 0);
    assert_eq!(control.counters().double_allocations, 0);
    assert_eq!(control.counters().polarity_violations, 0);
    assert_eq!(control.read_media(0, CAPACITY), model);
}
