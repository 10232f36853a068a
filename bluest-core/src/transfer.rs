//! Firmware transfer state machine.
//!
//! ```text
//! Idle --start--> AwaitingCrcAck --crc echo ok--> Uploading --last chunk--> AwaitingCompletionAck
//!  ^                   |                             |                            |
//!  +---- mismatch -----+------ reply / abort --------+--------- reply -----------+
//! ```
//!
//! The machine performs no I/O. [`FirmwareTransfer::start`] yields the command
//! frame to write, [`FirmwareTransfer::next_chunk`] the next slice to send,
//! and [`FirmwareTransfer::on_notification`] consumes whatever the node sends
//! back on the debug terminal. Pacing, timeouts and cancellation live in
//! [`BlueStNode::upgrade`](crate::BlueStNode::upgrade).

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use bluest_proto::firmware::{is_completion_ack, UpgradeCommand, MAX_CHUNK_LEN};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{debug, info, warn};

use crate::link::LinkError;

/// Transfer pacing and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferConfig {
    /// Bytes per chunk, at most [`MAX_CHUNK_LEN`].
    pub chunk_size: usize,
    /// Pause between chunk writes (about 90 Hz).
    pub chunk_interval_ms: u32,
    /// Report progress every this many chunks.
    pub progress_every: u32,
    /// How long the node may take to echo the checksum.
    pub crc_ack_timeout_ms: u32,
    /// How long the node may take to confirm the image after the last chunk.
    pub completion_ack_timeout_ms: u32,
    /// Wait before reconnecting to the rebooted node.
    pub reboot_grace_ms: u32,
}

/// Default transfer settings.
pub const DEFAULT_TRANSFER_CONFIG: TransferConfig = TransferConfig {
    chunk_size: MAX_CHUNK_LEN,
    chunk_interval_ms: 11,
    progress_every: 10,
    crc_ack_timeout_ms: 5_000,
    completion_ack_timeout_ms: 30_000,
    reboot_grace_ms: 30_000,
};

impl Default for TransferConfig {
    fn default() -> Self {
        DEFAULT_TRANSFER_CONFIG
    }
}

/// Phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferState {
    Idle,
    AwaitingCrcAck,
    Uploading,
    AwaitingCompletionAck,
}

/// Error type for firmware transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferError {
    /// A transfer is already in progress.
    Busy,
    /// The image has no bytes.
    EmptyImage,
    /// The image length does not fit the 32-bit length field.
    ImageTooLarge,
    /// The computed checksum is zero, which the node treats as a fault.
    ZeroChecksum,
    /// The node echoed a different checksum.
    ChecksumMismatch { expected: u32, received: u32 },
    /// The node answered the upload with something other than the
    /// completion acknowledgement.
    Rejected,
    /// No answer within the configured timeout.
    Timeout,
    /// Cancelled by the caller.
    Cancelled,
    /// The link failed mid-transfer.
    Link(LinkError),
}

impl From<LinkError> for TransferError {
    fn from(err: LinkError) -> Self {
        TransferError::Link(err)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Busy => f.write_str("firmware transfer already running"),
            TransferError::EmptyImage => f.write_str("firmware image is empty"),
            TransferError::ImageTooLarge => f.write_str("firmware image exceeds 4 GiB"),
            TransferError::ZeroChecksum => f.write_str("computed checksum is zero"),
            TransferError::ChecksumMismatch { expected, received } => write!(
                f,
                "checksum mismatch: sent {expected:#010x}, node echoed {received:#010x}"
            ),
            TransferError::Rejected => f.write_str("node rejected the image"),
            TransferError::Timeout => f.write_str("timed out waiting for the node"),
            TransferError::Cancelled => f.write_str("transfer cancelled"),
            TransferError::Link(e) => write!(f, "link error: {e}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransferError {}

/// Upload progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Progress {
    pub bytes_sent: u32,
    pub packets_sent: u32,
    pub total: u32,
}

impl Progress {
    /// Fraction of the image sent, `0.0..=1.0`.
    #[must_use]
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.bytes_sent as f32 / self.total as f32
    }
}

/// What a notification did to the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// The checksum echo matched; start uploading.
    CrcAccepted,
    /// The node confirmed the image.
    Completed,
    /// No transfer is running; the notification is not ours.
    Ignored,
}

/// Sans-I/O firmware upgrade state machine.
///
/// # Example
///
/// ```
/// use bluest_core::transfer::{FirmwareTransfer, Step, TransferState, DEFAULT_TRANSFER_CONFIG};
///
/// let image = [0x42u8; 40];
/// let mut transfer = FirmwareTransfer::new(DEFAULT_TRANSFER_CONFIG);
/// let command = transfer.start(&image).unwrap();
///
/// assert_eq!(transfer.on_notification(&command.crc.to_le_bytes()), Ok(Step::CrcAccepted));
/// let mut chunks = 0;
/// while let Some(chunk) = transfer.next_chunk() {
///     assert!(chunk.len() <= 16);
///     transfer.chunk_written();
///     chunks += 1;
/// }
/// assert_eq!(chunks, 3);
/// assert_eq!(transfer.state(), TransferState::AwaitingCompletionAck);
/// assert_eq!(transfer.on_notification(&[0x01]), Ok(Step::Completed));
/// ```
#[derive(Debug)]
pub struct FirmwareTransfer<'a> {
    config: TransferConfig,
    state: TransferState,
    content: &'a [u8],
    crc: u32,
    bytes_sent: u32,
    packets_sent: u32,
}

impl<'a> FirmwareTransfer<'a> {
    #[must_use]
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config: TransferConfig {
                chunk_size: config.chunk_size.clamp(1, MAX_CHUNK_LEN),
                progress_every: config.progress_every.max(1),
                ..config
            },
            state: TransferState::Idle,
            content: &[],
            crc: 0,
            bytes_sent: 0,
            packets_sent: 0,
        }
    }

    /// Begin a transfer of `content` and return the command frame to write.
    ///
    /// The checksum covers the 4-byte aligned prefix; the announced length
    /// is the full image. On error the machine stays idle.
    pub fn start(&mut self, content: &'a [u8]) -> Result<UpgradeCommand, TransferError> {
        if self.state != TransferState::Idle {
            return Err(TransferError::Busy);
        }
        if content.is_empty() {
            return Err(TransferError::EmptyImage);
        }
        let command = UpgradeCommand::for_image(content).ok_or(TransferError::ImageTooLarge)?;
        if command.crc == 0 {
            warn!("checksum of {} byte image is zero, aborting", content.len());
            return Err(TransferError::ZeroChecksum);
        }

        info!(
            "upgrade: {} bytes, crc {:#010x}",
            command.length, command.crc
        );
        self.content = content;
        self.crc = command.crc;
        self.bytes_sent = 0;
        self.packets_sent = 0;
        self.state = TransferState::AwaitingCrcAck;
        Ok(command)
    }

    /// Feed a notification received on the debug terminal.
    ///
    /// Any reply during or after the upload ends the transfer: `0x01` as
    /// success, anything else as [`TransferError::Rejected`].
    pub fn on_notification(&mut self, data: &[u8]) -> Result<Step, TransferError> {
        match self.state {
            TransferState::Idle => Ok(Step::Ignored),
            TransferState::AwaitingCrcAck => {
                let mut echo = [0u8; 4];
                let n = data.len().min(4);
                echo[..n].copy_from_slice(&data[..n]);
                let received = u32::from_le_bytes(echo);

                if data.len() >= 4 && received == self.crc {
                    debug!("crc echo matches, uploading");
                    self.state = TransferState::Uploading;
                    Ok(Step::CrcAccepted)
                } else {
                    let expected = self.crc;
                    self.abort();
                    Err(TransferError::ChecksumMismatch { expected, received })
                }
            }
            TransferState::Uploading | TransferState::AwaitingCompletionAck => {
                let sent = self.bytes_sent;
                self.abort();
                if is_completion_ack(data) {
                    info!("upgrade complete after {sent} bytes");
                    Ok(Step::Completed)
                } else {
                    Err(TransferError::Rejected)
                }
            }
        }
    }

    /// Next slice to write, or `None` outside the upload phase.
    #[must_use]
    pub fn next_chunk(&self) -> Option<&'a [u8]> {
        if self.state != TransferState::Uploading {
            return None;
        }
        let content = self.content;
        let start = self.bytes_sent as usize;
        let end = (start + self.config.chunk_size).min(content.len());
        (start < end).then(|| &content[start..end])
    }

    /// Record a successful write of the chunk from [`next_chunk`](Self::next_chunk).
    ///
    /// Returns progress every `progress_every` packets. After the last chunk
    /// the machine waits for the completion acknowledgement.
    pub fn chunk_written(&mut self) -> Option<Progress> {
        let len = self.next_chunk()?.len();
        self.bytes_sent += len as u32;
        self.packets_sent += 1;

        if self.bytes_sent as usize >= self.content.len() {
            debug!("all {} packets sent", self.packets_sent);
            self.state = TransferState::AwaitingCompletionAck;
        }

        (self.packets_sent % self.config.progress_every == 0).then(|| self.progress())
    }

    /// Return to idle, discarding counters.
    pub fn abort(&mut self) {
        if self.state != TransferState::Idle {
            debug!("transfer reset from {:?}", self.state);
        }
        self.state = TransferState::Idle;
        self.content = &[];
        self.crc = 0;
        self.bytes_sent = 0;
        self.packets_sent = 0;
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn crc(&self) -> u32 {
        self.crc
    }

    #[must_use]
    pub fn progress(&self) -> Progress {
        Progress {
            bytes_sent: self.bytes_sent,
            packets_sent: self.packets_sent,
            total: self.content.len() as u32,
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }
}

/// Cancellation flag for a running upgrade.
///
/// Shareable by reference between the task running the upgrade and whoever
/// wants to stop it. The upgrade checks the flag before it writes anything
/// and races [`CancelToken::cancelled`] against every wait.
pub struct CancelToken {
    flag: AtomicBool,
    signal: Signal<CriticalSectionRawMutex, ()>,
}

impl CancelToken {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            signal: Signal::new(),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.signal.signal(());
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.signal.wait().await;
        }
    }

    /// Clear the flag for the next transfer.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
        self.signal.reset();
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
