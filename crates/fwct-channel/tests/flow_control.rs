use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fwct_abi::ctb::frame_len_for_payload;
use fwct_abi::HxgType;
use fwct_channel::{
    Channel, ChannelConfig, CtError, DeferredDispatch, EventHandler, IncomingMessage,
    LoopbackFirmware, Reply, Request,
};
use pretty_assertions::assert_eq;

const TLB_INVALIDATION: u16 = 0x7000;
const TLB_INVALIDATION_DONE: u16 = 0x7001;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn enabled_channel(fw: &Arc<LoopbackFirmware>, config: ChannelConfig) -> Channel {
    let channel = Channel::init(config, &**fw, fw.clone()).unwrap();
    fw.connect(&channel);
    channel.enable().unwrap();
    channel
}

/// Answers every fast request with a DONE event echoing its first payload word.
fn done_responder(req: &Request) -> Reply {
    match req.ty {
        HxgType::FastRequest => Reply::Event {
            action: TLB_INVALIDATION_DONE,
            payload: vec![req.payload[0]],
        },
        _ => Reply::Silent,
    }
}

fn count_done(channel: &Channel) -> Arc<AtomicUsize> {
    let done = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&done);
    channel.register_event_handler(
        TLB_INVALIDATION_DONE,
        EventHandler::immediate(move |_: &IncomingMessage| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .releasing_credit(),
    );
    done
}

#[test]
fn credit_returns_when_the_reply_event_is_consumed() {
    let fw = LoopbackFirmware::with_responder(done_responder);
    let config = ChannelConfig {
        deferred_dispatch: DeferredDispatch::Manual,
        ..ChannelConfig::default()
    };
    let channel = enabled_channel(&fw, config);
    let done = count_done(&channel);
    let initial = channel.info().g2h.space;
    let reply_words = frame_len_for_payload(1);

    for seqno in 0..100 {
        channel
            .send_non_blocking(TLB_INVALIDATION, &[seqno], reply_words)
            .unwrap();
        assert_eq!(channel.info().g2h.space, initial);
    }
    assert_eq!(done.load(Ordering::SeqCst), 100);
}

#[test]
fn reply_events_return_exactly_the_reserved_credit() {
    let fw = LoopbackFirmware::with_responder(done_responder);
    let config = ChannelConfig {
        deferred_dispatch: DeferredDispatch::Manual,
        ..ChannelConfig::with_sizes(4096, 256)
    };
    let channel = enabled_channel(&fw, config);
    let done = count_done(&channel);
    let initial = channel.info().g2h.space;

    // Each reply event is 3 words; the sender budgets 5.
    for seqno in 0..200 {
        assert_eq!(
            channel.send_non_blocking(TLB_INVALIDATION, &[seqno], 5),
            Ok(())
        );
        let info = channel.info();
        assert_eq!(info.g2h.space, initial);
        assert_eq!(info.held_credit, 0);
    }
    assert_eq!(done.load(Ordering::SeqCst), 200);

    // An event nobody is waiting for returns nothing.
    fw.inject_event(TLB_INVALIDATION_DONE, &[0; 8]);
    assert_eq!(channel.info().g2h.space, initial);
}

#[test]
fn failed_fast_request_returns_its_credit() {
    let fw = LoopbackFirmware::with_responder(|req: &Request| match req.ty {
        HxgType::FastRequest => Reply::Failure {
            error: 0x30,
            hint: 0,
        },
        _ => Reply::Silent,
    });
    let config = ChannelConfig {
        deferred_dispatch: DeferredDispatch::Manual,
        ..ChannelConfig::default()
    };
    let channel = enabled_channel(&fw, config);
    let initial = channel.info().g2h.space;

    for seqno in 0..10 {
        channel
            .send_non_blocking(TLB_INVALIDATION, &[seqno], 7)
            .unwrap();
    }
    let info = channel.info();
    assert_eq!(info.g2h.space, initial);
    assert_eq!(info.held_credit, 0);
    assert!(!channel.is_broken());
}

#[test]
fn outstanding_fast_requests_hold_credit_until_serviced() {
    let fw = LoopbackFirmware::with_responder(done_responder);
    let config = ChannelConfig {
        deferred_dispatch: DeferredDispatch::Manual,
        ..ChannelConfig::with_sizes(4096, 256)
    };
    let channel = enabled_channel(&fw, config);
    let done = count_done(&channel);
    let initial = channel.info().g2h.space;
    assert_eq!(initial, 63 - 16);

    fw.set_stalled(true);
    let reply_words = frame_len_for_payload(1);
    let mut sent = 0;
    loop {
        match channel.send_non_blocking(TLB_INVALIDATION, &[sent], reply_words) {
            Ok(()) => sent += 1,
            Err(CtError::Busy) => break,
            Err(err) => panic!("unexpected error {err}"),
        }
    }
    assert_eq!(sent, initial / reply_words);
    assert_eq!(channel.info().g2h.space, initial - sent * reply_words);
    assert_eq!(channel.info().held_credit, sent * reply_words);

    fw.set_stalled(false);
    assert_eq!(fw.service(), sent as usize);
    assert_eq!(done.load(Ordering::SeqCst), sent as usize);
    assert_eq!(channel.info().g2h.space, initial);
}

#[test]
fn full_h2g_makes_non_blocking_sends_busy() {
    let fw = LoopbackFirmware::new();
    let config = ChannelConfig {
        deferred_dispatch: DeferredDispatch::Manual,
        stall_timeout: Duration::from_secs(60),
        ..ChannelConfig::with_sizes(64, 4096)
    };
    let channel = enabled_channel(&fw, config);
    fw.set_stalled(true);

    // 15 usable words: two 6-word frames fit, a third does not.
    channel.send_non_blocking(0x20, &[0; 4], 0).unwrap();
    channel.send_non_blocking(0x20, &[0; 4], 0).unwrap();
    assert_eq!(
        channel.send_non_blocking(0x20, &[0; 4], 0),
        Err(CtError::Busy)
    );
    assert!(channel.info().stalled_for.is_some());

    fw.set_stalled(false);
    fw.service();
    channel.send_non_blocking(0x20, &[0; 4], 0).unwrap();
    assert_eq!(channel.info().stalled_for, None);
    assert!(!channel.is_broken());
}

#[test]
fn blocking_send_waits_for_h2g_space() {
    let fw = LoopbackFirmware::new();
    let config = ChannelConfig {
        deferred_dispatch: DeferredDispatch::Manual,
        ..ChannelConfig::with_sizes(64, 4096)
    };
    let channel = enabled_channel(&fw, config);
    fw.set_stalled(true);
    channel.send_non_blocking(0x20, &[0; 10], 0).unwrap();

    let releaser = {
        let fw = Arc::clone(&fw);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            fw.set_stalled(false);
            fw.service();
        })
    };

    let mut out = [0u32; 4];
    assert_eq!(channel.send_with_reply(0x21, &[1, 2, 3, 4], &mut out), Ok(16));
    releaser.join().unwrap();
    assert_eq!(out, [1, 2, 3, 4]);
}

#[test]
fn stalled_firmware_trips_deadlock_detection() {
    init_tracing();
    let fw = LoopbackFirmware::new();
    let config = ChannelConfig {
        deferred_dispatch: DeferredDispatch::Manual,
        response_spin: Duration::ZERO,
        response_timeout: Duration::from_secs(30),
        stall_timeout: Duration::from_millis(200),
        ..ChannelConfig::with_sizes(64, 4096)
    };
    let channel = enabled_channel(&fw, config);
    fw.set_stalled(true);

    let waiter = {
        let channel = channel.clone();
        thread::spawn(move || channel.send(0x30, &[0; 8]))
    };
    while fw.doorbell_count() == 0 {
        thread::yield_now();
    }

    let start = Instant::now();
    assert_eq!(channel.send(0x31, &[0; 8]), Err(CtError::Broken));
    assert_eq!(waiter.join().unwrap(), Err(CtError::Broken));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");

    assert!(channel.is_broken());
    assert!(channel.info().h2g.broken);
    assert_eq!(channel.send(0x32, &[]), Err(CtError::Broken));
    assert_eq!(
        channel.send_non_blocking(0x32, &[], 0),
        Err(CtError::Broken)
    );

    // Only a full re-init brings the channel back.
    fw.set_stalled(false);
    channel.disable();
    channel.enable().unwrap();
    channel.send(0x33, &[]).unwrap();
}
