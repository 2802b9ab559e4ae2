//! Well-known action codes.
//!
//! The transport treats action codes as opaque; these are listed so collaborators and tests share
//! one spelling. Host-to-firmware actions use the low ranges, firmware-to-host notifications the
//! `0x6000..` and up ranges.

// Host → firmware.
pub const DEFAULT: u16 = 0x0000;
pub const PING: u16 = 0x0001;
pub const REQUEST_PREEMPTION: u16 = 0x0002;
pub const REQUEST_ENGINE_RESET: u16 = 0x0003;
pub const PAGE_FAULT_RESPONSE: u16 = 0x0004;
pub const UK_LOG_ENABLE_LOGGING: u16 = 0x0040;
pub const FORCE_LOG_BUFFER_FLUSH: u16 = 0x0302;
pub const SELF_CFG: u16 = 0x0508;
pub const REGISTER_CONTEXT: u16 = 0x4502;
pub const DEREGISTER_CONTEXT: u16 = 0x4503;
pub const CONTROL_CTB: u16 = 0x4509;
pub const VF2GUC_RELAY_TO_PF: u16 = 0x5103;
pub const TLB_INVALIDATION: u16 = 0x7000;

// Firmware → host.
pub const SCHED_CONTEXT_MODE_DONE: u16 = 0x1002;
pub const DEREGISTER_CONTEXT_DONE: u16 = 0x4600;
pub const GUC2PF_RELAY_FROM_VF: u16 = 0x5100;
pub const GUC2VF_RELAY_FROM_PF: u16 = 0x5102;
pub const PAGE_FAULT_NOTIFY: u16 = 0x6002;
pub const ACCESS_COUNTER_NOTIFY: u16 = 0x6004;
pub const TLB_INVALIDATION_DONE: u16 = 0x7001;
pub const NOTIFY_FLUSH_LOG_BUFFER: u16 = 0x8003;
pub const NOTIFY_EXCEPTION: u16 = 0x8005;
