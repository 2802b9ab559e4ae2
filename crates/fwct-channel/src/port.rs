//! Host → firmware signalling outside the rings.

/// Failure of an out-of-band MMIO exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MmioError {
    #[error("firmware is not running")]
    NotRunning,
    #[error("request rejected with error {error:#06x}")]
    Rejected { error: u16 },
    #[error("malformed request")]
    Malformed,
    #[error("timed out waiting for the reply")]
    Timeout,
}

/// The device side of the channel: doorbell, scratch-register messaging and liveness.
pub trait FirmwarePort: Send + Sync {
    /// Notify the firmware that H2G has new frames.
    fn ring_doorbell(&self);

    /// Send an MMIO request and return the `data0` of its success reply.
    fn send_mmio(&self, request: &[u32]) -> Result<u32, MmioError>;

    /// Whether the firmware can still be talked to. Disable skips the CONTROL_CTB call when
    /// this is `false`.
    fn is_running(&self) -> bool {
        true
    }
}
