use std::sync::Arc;

use fwct_abi::mmio::{
    MmioRequest, SelfCfg, KLV_G2H_CTB_ADDR, KLV_G2H_CTB_DESCRIPTOR_ADDR, KLV_G2H_CTB_SIZE,
    KLV_H2G_CTB_ADDR, KLV_H2G_CTB_DESCRIPTOR_ADDR, KLV_H2G_CTB_SIZE,
};
use fwct_channel::{
    AllocError, Channel, ChannelConfig, CtError, DeferredDispatch, HeapAllocator,
    LoopbackFirmware, SharedBlob, SharedMemoryAllocator,
};
use pretty_assertions::assert_eq;

fn manual() -> ChannelConfig {
    ChannelConfig {
        deferred_dispatch: DeferredDispatch::Manual,
        ..ChannelConfig::default()
    }
}

fn klv(key: u16, value: u64) -> MmioRequest {
    MmioRequest::SelfCfg(SelfCfg {
        key,
        len: fwct_abi::mmio::klv_len(key),
        value,
    })
}

#[test]
fn enable_registers_g2h_then_h2g_then_enables() {
    let fw = LoopbackFirmware::new();
    let channel = Channel::init(manual(), &*fw, fw.clone()).unwrap();
    assert!(fw.mmio_log().is_empty());
    assert!(!channel.is_enabled());

    channel.enable().unwrap();
    assert!(channel.is_enabled());
    assert!(fw.is_enabled());

    let base = channel.blob().base_addr();
    let layout = *channel.layout();
    let at = |offset: usize| base + offset as u64;
    assert_eq!(
        fw.mmio_log(),
        vec![
            klv(KLV_G2H_CTB_DESCRIPTOR_ADDR, at(layout.g2h_desc.offset_bytes)),
            klv(KLV_G2H_CTB_ADDR, at(layout.g2h_cmds.offset_bytes)),
            klv(KLV_G2H_CTB_SIZE, 16384),
            klv(KLV_H2G_CTB_DESCRIPTOR_ADDR, at(layout.h2g_desc.offset_bytes)),
            klv(KLV_H2G_CTB_ADDR, at(layout.h2g_cmds.offset_bytes)),
            klv(KLV_H2G_CTB_SIZE, 4096),
            MmioRequest::ControlCtb { enable: true },
        ]
    );

    // Enabling twice is a no-op.
    channel.enable().unwrap();
    assert_eq!(fw.mmio_log().len(), 7);
}

#[test]
fn disable_closes_the_channel_and_tells_the_firmware() {
    let fw = LoopbackFirmware::new();
    let channel = Channel::init(manual(), &*fw, fw.clone()).unwrap();
    fw.connect(&channel);
    channel.enable().unwrap();
    channel.send(0x10, &[]).unwrap();

    channel.disable();
    assert!(!channel.is_enabled());
    assert!(!fw.is_enabled());
    assert_eq!(
        fw.mmio_log().last(),
        Some(&MmioRequest::ControlCtb { enable: false })
    );
    assert_eq!(channel.send(0x10, &[]), Err(CtError::NotEnabled));
    assert_eq!(channel.handle_interrupt(), Err(CtError::NotEnabled));

    // A second disable does nothing.
    let calls = fw.mmio_log().len();
    channel.disable();
    assert_eq!(fw.mmio_log().len(), calls);
}

#[test]
fn disable_skips_the_handshake_when_firmware_is_gone() {
    let fw = LoopbackFirmware::new();
    let channel = Channel::init(manual(), &*fw, fw.clone()).unwrap();
    channel.enable().unwrap();
    let calls = fw.mmio_log().len();

    fw.set_running(false);
    channel.disable();
    assert!(!channel.is_enabled());
    assert_eq!(fw.mmio_log().len(), calls);
}

#[test]
fn failed_handshake_leaves_the_channel_disabled() {
    let fw = LoopbackFirmware::new();
    let channel = Channel::init(manual(), &*fw, fw.clone()).unwrap();
    fw.set_running(false);

    assert!(matches!(channel.enable(), Err(CtError::Mmio(_))));
    assert!(!channel.is_enabled());

    fw.set_running(true);
    channel.enable().unwrap();
}

#[test]
fn re_enable_starts_from_empty_rings() {
    let fw = LoopbackFirmware::new();
    let channel = Channel::init(manual(), &*fw, fw.clone()).unwrap();
    fw.connect(&channel);
    channel.enable().unwrap();
    for i in 0..10 {
        channel.send(0x10, &[i]).unwrap();
    }
    assert_ne!(channel.info().h2g.tail, 0);

    channel.disable();
    channel.enable().unwrap();
    let info = channel.info();
    assert_eq!((info.h2g.head, info.h2g.tail), (0, 0));
    assert_eq!((info.g2h.head, info.g2h.tail), (0, 0));
    channel.send(0x10, &[]).unwrap();
}

#[test]
fn invalid_sizes_are_rejected_at_init() {
    let fw = LoopbackFirmware::new();
    let bad = ChannelConfig {
        h2g_bytes: 3000,
        ..manual()
    };
    assert!(matches!(
        Channel::init(bad, &*fw, fw.clone()),
        Err(CtError::Config(_))
    ));

    let no_credit = ChannelConfig {
        g2h_reserved_bytes: 16384,
        ..manual()
    };
    assert!(matches!(
        Channel::init(no_credit, &*fw, fw.clone()),
        Err(CtError::Config(_))
    ));
}

struct NoMemory;

impl SharedMemoryAllocator for NoMemory {
    fn allocate(&self, size_bytes: usize) -> Result<Arc<SharedBlob>, AllocError> {
        Err(AllocError::Exhausted {
            requested: size_bytes,
            available: 0,
        })
    }
}

#[test]
fn allocation_failure_is_reported() {
    let fw = LoopbackFirmware::new();
    assert!(matches!(
        Channel::init(manual(), &NoMemory, fw.clone()),
        Err(CtError::OutOfMemory(_))
    ));

    let tiny = HeapAllocator::new(0, 4096);
    assert!(matches!(
        Channel::init(manual(), &tiny, fw),
        Err(CtError::OutOfMemory(_))
    ));
}

/// Hands out a fixed-size blob whatever was asked for.
struct ShortBlob(usize);

impl SharedMemoryAllocator for ShortBlob {
    fn allocate(&self, _size_bytes: usize) -> Result<Arc<SharedBlob>, AllocError> {
        Ok(Arc::new(SharedBlob::new(0x2000, self.0)))
    }
}

#[test]
fn undersized_blob_is_rejected_at_init() {
    let fw = LoopbackFirmware::new();
    let err = Channel::init(manual(), &ShortBlob(4096), fw.clone()).unwrap_err();
    assert!(matches!(err, CtError::OutOfMemory(_)), "{err:?}");

    let exact = ShortBlob(fwct_abi::BlobLayout::default().total_bytes);
    assert!(Channel::init(manual(), &exact, fw).is_ok());
}

#[test]
fn fini_stops_the_worker_and_disables() {
    let fw = LoopbackFirmware::new();
    let channel = Channel::init(ChannelConfig::default(), &*fw, fw.clone()).unwrap();
    channel.enable().unwrap();
    channel.fini();
    assert!(!fw.is_enabled());
}
