use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fwct_abi::{CtbHeader, HxgHeader, HxgOrigin, HxgType};
use fwct_channel::{
    Channel, ChannelConfig, CtError, DeferredDispatch, EventHandler, IncomingMessage,
    LoopbackFirmware,
};
use pretty_assertions::assert_eq;

const PAGE_FAULT_NOTIFY: u16 = 0x6002;
const NOTIFY_EXCEPTION: u16 = 0x8005;
const PAGE_FAULT_RESPONSE: u16 = 0x0004;

fn enabled_channel(fw: &Arc<LoopbackFirmware>, config: ChannelConfig) -> Channel {
    let channel = Channel::init(config, &**fw, fw.clone()).unwrap();
    fw.connect(&channel);
    channel.enable().unwrap();
    channel
}

fn manual() -> ChannelConfig {
    ChannelConfig {
        deferred_dispatch: DeferredDispatch::Manual,
        ..ChannelConfig::default()
    }
}

#[test]
fn immediate_handlers_run_on_the_interrupt_path() {
    let fw = LoopbackFirmware::new();
    let channel = enabled_channel(&fw, manual());

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        channel.register_event_handler(
            NOTIFY_EXCEPTION,
            EventHandler::immediate(move |msg: &IncomingMessage| {
                seen.lock()
                    .unwrap()
                    .push((thread::current().id(), msg.payload().to_vec()));
                Ok(())
            }),
        );
    }

    assert!(fw.inject_event(NOTIFY_EXCEPTION, &[0xdead]));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, thread::current().id());
    assert_eq!(seen[0].1, vec![0xdead]);
    assert!(!channel.has_deferred_work());
}

#[test]
fn deferred_handlers_run_in_order_when_drained() {
    let fw = LoopbackFirmware::new();
    let channel = enabled_channel(&fw, manual());

    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = Arc::clone(&order);
        channel.register_event_handler(
            PAGE_FAULT_NOTIFY,
            EventHandler::deferred(move |_: &Channel, msg: &IncomingMessage| {
                order.lock().unwrap().push(msg.payload()[0]);
                Ok(())
            }),
        );
    }

    for i in 0..5 {
        fw.inject_event(PAGE_FAULT_NOTIFY, &[i]);
    }
    assert!(channel.has_deferred_work());
    assert!(order.lock().unwrap().is_empty());
    assert_eq!(channel.info().queued_events, 5);

    assert_eq!(channel.run_deferred_work(), 5);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(!channel.has_deferred_work());
    assert_eq!(channel.run_deferred_work(), 0);
}

#[test]
fn deferred_handler_on_the_worker_can_send() {
    let fw = LoopbackFirmware::new();
    let channel = enabled_channel(&fw, ChannelConfig::default());

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    channel.register_event_handler(
        PAGE_FAULT_NOTIFY,
        EventHandler::deferred(move |channel: &Channel, msg: &IncomingMessage| {
            let mut out = [0u32; 1];
            let result = channel.send_with_reply(PAGE_FAULT_RESPONSE, msg.payload(), &mut out);
            let worker = thread::current().name().map(str::to_owned);
            let _ = tx.lock().unwrap().send((worker, result, out[0]));
            Ok(())
        }),
    );

    fw.inject_event(PAGE_FAULT_NOTIFY, &[0x1234]);
    let (worker, result, echoed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(worker.as_deref(), Some("fwct-deferred"));
    assert_eq!(result, Ok(4));
    assert_eq!(echoed, 0x1234);

    let sent = fw.received();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].action, PAGE_FAULT_RESPONSE);
    channel.fini();
}

#[test]
fn events_without_a_handler_are_dropped() {
    let fw = LoopbackFirmware::new();
    let channel = enabled_channel(&fw, manual());

    fw.inject_event(0x0bad, &[1, 2]);
    assert_eq!(channel.run_deferred_work(), 1);
    assert!(!channel.is_broken());
    channel.send(0x10, &[]).unwrap();
}

#[test]
fn handler_errors_do_not_break_the_channel() {
    let fw = LoopbackFirmware::new();
    let channel = enabled_channel(&fw, manual());
    channel.register_event_handler(
        NOTIFY_EXCEPTION,
        EventHandler::immediate(|_: &IncomingMessage| -> Result<(), CtError> {
            Err(CtError::Busy)
        }),
    );

    fw.inject_event(NOTIFY_EXCEPTION, &[]);
    assert!(!channel.is_broken());
    channel.send(0x10, &[]).unwrap();
}

#[test]
fn malformed_frames_are_dropped_without_breaking() {
    let fw = LoopbackFirmware::new();
    let channel = enabled_channel(&fw, manual());

    let host_origin = HxgHeader {
        origin: HxgOrigin::Host,
        ty: HxgType::Event,
        data0: u32::from(NOTIFY_EXCEPTION),
    };
    let unknown_format = CtbHeader {
        fence: 0,
        format: 3,
        num_dwords: 1,
    };
    let unsolicited = [
        CtbHeader::hxg(0x4242, 0).unwrap().encode(),
        HxgHeader::success(0).encode(),
    ];
    let fast_request_echo = [
        CtbHeader::hxg(1, 0).unwrap().encode(),
        HxgHeader::fast_request(1).encode(),
    ];

    assert!(fw.inject_frames(&[
        vec![CtbHeader::hxg(0, 0).unwrap().encode(), host_origin.encode()],
        vec![unknown_format.encode(), HxgHeader::event(1).encode()],
        unsolicited.to_vec(),
        fast_request_echo.to_vec(),
    ]));

    assert!(!channel.is_broken());
    assert_eq!(channel.info().queued_events, 0);
    let g2h = channel.info().g2h;
    assert_eq!(g2h.head, g2h.tail);
    channel.send(0x10, &[]).unwrap();
}
