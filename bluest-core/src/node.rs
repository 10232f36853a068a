//! BlueStNode: drives one connected BlueST node over a [`DeviceLink`].

use core::future::Future;

use bluest_proto::mask::{MaskPolicy, DEFAULT_MASK_POLICY, MASK_FEATURE_BITS};
use bluest_proto::terminal::{
    self, FirmwareVersion, ResponseAccumulator, TerminalError, MAX_RESPONSE_LEN, VERSION_COMMAND,
};
use bluest_proto::uuids;
use embassy_futures::select::{select, select3, Either, Either3};
use embedded_hal_async::delay::DelayNs;
use heapless::Vec;
use log::{debug, error, info, warn};

use crate::channel::{ChannelError, SensorChannel, SubscriptionChange};
use crate::event::{status_text, Event, EventSink};
use crate::link::{CharacteristicId, DeviceLink, LinkError, WriteMode, MAX_NOTIFICATION_LEN};
use crate::registry::{ChannelRegistry, FeatureRef, MAX_CHANNELS};
use crate::transfer::{
    CancelToken, FirmwareTransfer, TransferConfig, TransferError, TransferState,
    DEFAULT_TRANSFER_CONFIG,
};

/// Debug terminal request settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TerminalConfig {
    /// How long a complete reply may take.
    pub response_timeout_ms: u32,
}

pub const DEFAULT_TERMINAL_CONFIG: TerminalConfig = TerminalConfig {
    response_timeout_ms: 3_000,
};

/// Node driver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeConfig {
    pub mask_policy: MaskPolicy,
    pub transfer: TransferConfig,
    pub terminal: TerminalConfig,
}

/// Default node configuration.
pub const DEFAULT_NODE_CONFIG: NodeConfig = NodeConfig {
    mask_policy: DEFAULT_MASK_POLICY,
    transfer: DEFAULT_TRANSFER_CONFIG,
    terminal: DEFAULT_TERMINAL_CONFIG,
};

impl Default for NodeConfig {
    fn default() -> Self {
        DEFAULT_NODE_CONFIG
    }
}

/// Error type for node operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeError {
    Link(LinkError),
    Channel(ChannelError),
    Terminal(TerminalError),
    /// The feature has no write-back command.
    NoCommand,
    /// The node did not answer in time.
    Timeout,
}

impl From<LinkError> for NodeError {
    fn from(err: LinkError) -> Self {
        NodeError::Link(err)
    }
}

impl From<ChannelError> for NodeError {
    fn from(err: ChannelError) -> Self {
        NodeError::Channel(err)
    }
}

impl From<TerminalError> for NodeError {
    fn from(err: TerminalError) -> Self {
        NodeError::Terminal(err)
    }
}

impl core::fmt::Display for NodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NodeError::Link(e) => write!(f, "link: {e}"),
            NodeError::Channel(e) => write!(f, "channel: {e}"),
            NodeError::Terminal(e) => write!(f, "terminal: {e}"),
            NodeError::NoCommand => f.write_str("feature has no command"),
            NodeError::Timeout => f.write_str("timed out waiting for the node"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for NodeError {}

/// Where notifications go when nobody is waiting for them.
struct Router<E> {
    channels: ChannelRegistry,
    terminal: Option<CharacteristicId>,
    stderr: Option<CharacteristicId>,
    events: E,
}

impl<E: EventSink> Router<E> {
    fn dispatch(&mut self, id: CharacteristicId, data: &[u8]) {
        if Some(id) == self.stderr {
            let text = status_text(data);
            warn!("node stderr: {}", text);
            self.events.emit(Event::StatusMessage(text));
        } else if Some(id) == self.terminal {
            let text = status_text(data);
            info!("node terminal: {}", text);
            self.events.emit(Event::StatusMessage(text));
        } else if let Some(channel) = self.channels.get_mut(id) {
            let events = &mut self.events;
            channel.decode(data, |feature| {
                if let Some(value) = feature.last_value() {
                    events.emit(Event::ValueUpdated {
                        feature: FeatureRef {
                            channel: id,
                            mask: feature.definition().mask,
                        },
                        value: *value,
                    });
                }
            });
        } else {
            debug!("notification on unknown characteristic {:?}", id);
        }
    }

    fn reset(&mut self) {
        self.channels.clear();
        self.terminal = None;
        self.stderr = None;
    }
}

/// Drives one BlueST node: discovery, sensor notifications, the debug
/// terminal and firmware upgrades.
///
/// All node state lives here and is only touched through `&mut self`, so
/// notifications, user commands and transfers are serialized by
/// construction.
///
/// # Error Handling
///
/// Protocol problems (short payloads, unparseable replies, rejected images)
/// are reported as [`Event`]s and logged. Link errors end whatever operation
/// was in flight and are returned to the caller.
pub struct BlueStNode<L, D, E> {
    link: L,
    delay: D,
    router: Router<E>,
    config: NodeConfig,
}

impl<L: DeviceLink, D: DelayNs, E: EventSink> BlueStNode<L, D, E> {
    /// Create a node driver with the default configuration.
    pub fn new(link: L, delay: D, events: E) -> Self {
        Self::with_config(link, delay, events, DEFAULT_NODE_CONFIG)
    }

    pub fn with_config(link: L, delay: D, events: E, config: NodeConfig) -> Self {
        Self {
            link,
            delay,
            router: Router {
                channels: ChannelRegistry::new(),
                terminal: None,
                stderr: None,
                events,
            },
            config,
        }
    }

    /// Discover characteristics and bind a channel to every feature
    /// characteristic. Returns the number of features bound.
    ///
    /// Any previous discovery result is dropped first.
    pub async fn discover(&mut self) -> Result<usize, NodeError> {
        let characteristics = self.link.discover().await?;
        self.router.reset();

        let mut bound = 0;
        for c in &characteristics {
            if c.uuid == uuids::DEBUG_TERMINAL {
                debug!("debug terminal on {:?}", c.id);
                self.router.terminal = Some(c.id);
            } else if c.uuid == uuids::DEBUG_STDERR {
                debug!("debug stderr on {:?}", c.id);
                self.router.stderr = Some(c.id);
            }

            if !uuids::is_feature_service(&c.service) {
                continue;
            }

            let mask = uuids::feature_mask(&c.uuid);
            let channel = SensorChannel::from_mask(c.id, mask, &self.config.mask_policy);
            if channel.features().is_empty() {
                debug!("characteristic {} has no known features", c.uuid);
                continue;
            }
            if let Err(e) = self.router.channels.insert(channel) {
                warn!("dropping channel {:?} (mask {:#010x}): {}", c.id, mask, e);
                continue;
            }

            let Router {
                channels, events, ..
            } = &mut self.router;
            if let Some(channel) = channels.get(c.id) {
                for feature in channel.features() {
                    info!(
                        "feature {} on {:?} at offset {}",
                        feature.definition().name,
                        c.id,
                        feature.offset()
                    );
                    events.emit(Event::FeatureDiscovered {
                        feature: FeatureRef {
                            channel: c.id,
                            mask: feature.definition().mask,
                        },
                        name: feature.definition().name,
                        unit: feature.definition().unit,
                    });
                    bound += 1;
                }
            }
        }

        info!(
            "discovered {} channels, {} features",
            self.router.channels.len(),
            bound
        );
        Ok(bound)
    }

    /// Start decoding a feature, turning notifications on for its channel
    /// when it is the first one enabled.
    pub async fn enable_feature(&mut self, feature: FeatureRef) -> Result<(), NodeError> {
        let channel = self
            .router
            .channels
            .get_mut(feature.channel)
            .ok_or(ChannelError::UnknownChannel)?;

        if channel.enable(feature.mask)? == SubscriptionChange::Subscribe {
            if let Err(e) = self.link.set_notify(feature.channel, true).await {
                // Keep local state in line with the transport.
                if let Some(channel) = self.router.channels.get_mut(feature.channel) {
                    let _ = channel.disable(feature.mask);
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Stop decoding a feature, turning notifications off for its channel
    /// when it was the last one enabled.
    pub async fn disable_feature(&mut self, feature: FeatureRef) -> Result<(), NodeError> {
        let channel = self
            .router
            .channels
            .get_mut(feature.channel)
            .ok_or(ChannelError::UnknownChannel)?;

        if channel.disable(feature.mask)? == SubscriptionChange::Unsubscribe {
            self.link.set_notify(feature.channel, false).await?;
        }
        Ok(())
    }

    /// Enable every discovered feature. Returns how many were enabled.
    pub async fn enable_all(&mut self) -> Result<usize, NodeError> {
        let features: Vec<FeatureRef, { MAX_CHANNELS * MASK_FEATURE_BITS }> =
            self.router.channels.features().map(|(f, _)| f).collect();
        for &feature in &features {
            self.enable_feature(feature).await?;
        }
        Ok(features.len())
    }

    /// Send the feature's write-back command, e.g. flip a switch.
    pub async fn toggle_switch(&mut self, feature: FeatureRef) -> Result<(), NodeError> {
        let instance = self
            .router
            .channels
            .feature(feature)
            .ok_or(ChannelError::UnknownFeature)?;
        let command = instance.definition().command.ok_or(NodeError::NoCommand)?;
        let payload = command.payload(instance.last_value());

        debug!("{} command {:?}", instance.definition().name, payload);
        self.link
            .write(feature.channel, &payload, WriteMode::WithResponse)
            .await?;
        Ok(())
    }

    /// Ask the node for its firmware version.
    ///
    /// A reply that does not parse is surfaced as [`Event::StatusMessage`]
    /// and returned as [`TerminalError::Malformed`].
    pub async fn query_version(&mut self) -> Result<FirmwareVersion, NodeError> {
        let terminal = self.terminal_id()?;
        let command = terminal::encode_command(VERSION_COMMAND)?;

        self.link.set_notify(terminal, true).await?;
        self.link
            .write(terminal, &command, WriteMode::WithResponse)
            .await?;

        let mut response = ResponseAccumulator::<MAX_RESPONSE_LEN>::new();
        let mut buf = [0u8; MAX_NOTIFICATION_LEN];
        with_timeout(
            &mut self.delay,
            self.config.terminal.response_timeout_ms,
            read_response(&mut self.link, &mut self.router, terminal, &mut response, &mut buf),
        )
        .await
        .ok_or(NodeError::Timeout)??;

        match FirmwareVersion::parse(response.text()) {
            Ok(version) => {
                info!("firmware {}", version);
                self.router.events.emit(Event::VersionReported(version.clone()));
                if let Err(e) = self.link.set_notify(terminal, false).await {
                    warn!("could not disable terminal notifications: {}", e);
                }
                Ok(version)
            }
            Err(e) => {
                let text = status_text(response.text().as_bytes());
                info!("unexpected version reply: {}", text);
                self.router.events.emit(Event::StatusMessage(text));
                Err(e.into())
            }
        }
    }

    /// Upload a firmware image.
    ///
    /// Waits for the checksum echo, sends the image in paced chunks, then
    /// waits for the completion acknowledgement. On success the node reboots;
    /// after the grace period the link is asked to reconnect and discovery
    /// state is cleared. Cancelling `cancel` ends the upgrade at the next
    /// write or wait with [`TransferError::Cancelled`].
    pub async fn upgrade(&mut self, image: &[u8], cancel: &CancelToken) -> Result<(), TransferError> {
        let result = self.transfer(image, cancel).await;
        match result {
            Ok(()) => {
                self.router.events.emit(Event::TransferCompleted);

                let grace = self.config.transfer.reboot_grace_ms;
                info!("waiting {} ms for the node to reboot", grace);
                self.delay.delay_ms(grace).await;

                self.router.reset();
                if let Err(e) = self.link.reconnect().await {
                    warn!("reconnect after upgrade failed: {}", e);
                }
            }
            Err(e) => {
                error!("upgrade failed: {}", e);
                self.router.events.emit(Event::TransferFailed(e));
            }
        }
        result
    }

    async fn transfer(&mut self, image: &[u8], cancel: &CancelToken) -> Result<(), TransferError> {
        let terminal = self
            .router
            .terminal
            .ok_or(LinkError::MissingCharacteristic)?;
        if !self.link.is_connected() {
            return Err(LinkError::Disconnected.into());
        }

        if cancel.is_cancelled() {
            warn!("upgrade cancelled before start");
            return Err(TransferError::Cancelled);
        }

        let config = self.config.transfer;
        let mut transfer = FirmwareTransfer::new(config);
        let command = transfer.start(image)?;
        let mut buf = [0u8; MAX_NOTIFICATION_LEN];

        self.link.set_notify(terminal, true).await?;
        self.link
            .write(terminal, &command.to_bytes(), WriteMode::WithResponse)
            .await?;

        let len = await_terminal(
            &mut self.link,
            &mut self.delay,
            &mut self.router,
            terminal,
            &mut buf,
            config.crc_ack_timeout_ms,
            cancel,
        )
        .await?
        .ok_or(TransferError::Timeout)?;
        transfer.on_notification(&buf[..len])?;

        while transfer.state() == TransferState::Uploading {
            // Pace every write; a reply in the meantime ends the upload.
            let paced = await_terminal(
                &mut self.link,
                &mut self.delay,
                &mut self.router,
                terminal,
                &mut buf,
                config.chunk_interval_ms,
                cancel,
            )
            .await;
            match paced {
                Ok(Some(len)) => return self.finish(&mut transfer, &buf[..len]),
                Ok(None) => {}
                Err(TransferError::Cancelled) => {
                    warn!(
                        "upgrade cancelled after {} bytes",
                        transfer.progress().bytes_sent
                    );
                    return Err(TransferError::Cancelled);
                }
                Err(e) => return Err(e),
            }

            let Some(chunk) = transfer.next_chunk() else {
                break;
            };
            self.link
                .write(terminal, chunk, WriteMode::WithoutResponse)
                .await?;
            if let Some(progress) = transfer.chunk_written() {
                debug!("sent {}/{} bytes", progress.bytes_sent, progress.total);
                self.router.events.emit(Event::TransferProgress(progress));
            }
        }

        let len = await_terminal(
            &mut self.link,
            &mut self.delay,
            &mut self.router,
            terminal,
            &mut buf,
            config.completion_ack_timeout_ms,
            cancel,
        )
        .await?
        .ok_or(TransferError::Timeout)?;
        self.finish(&mut transfer, &buf[..len])
    }

    fn finish(&mut self, transfer: &mut FirmwareTransfer<'_>, reply: &[u8]) -> Result<(), TransferError> {
        match transfer.on_notification(reply) {
            Ok(_) => Ok(()),
            Err(TransferError::Rejected) => {
                let text = status_text(reply);
                warn!("node rejected image: {}", text);
                self.router.events.emit(Event::StatusMessage(text));
                Err(TransferError::Rejected)
            }
            Err(e) => Err(e),
        }
    }

    /// Route one notification that nobody is waiting for.
    pub fn handle_notification(&mut self, characteristic: CharacteristicId, data: &[u8]) {
        self.router.dispatch(characteristic, data);
    }

    /// Wait for and route one notification.
    pub async fn process_one(&mut self) -> Result<(), NodeError> {
        let mut buf = [0u8; MAX_NOTIFICATION_LEN];
        let notification = self.link.receive(&mut buf).await?;
        let len = notification.len.min(buf.len());
        self.router.dispatch(notification.characteristic, &buf[..len]);
        Ok(())
    }

    /// Route notifications until the link fails.
    pub async fn run(&mut self) -> Result<(), NodeError> {
        loop {
            self.process_one().await?;
        }
    }

    fn terminal_id(&self) -> Result<CharacteristicId, LinkError> {
        if !self.link.is_connected() {
            return Err(LinkError::Disconnected);
        }
        self.router.terminal.ok_or(LinkError::MissingCharacteristic)
    }

    /// Channels bound by the last discovery.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.router.channels
    }

    /// Handle of the debug terminal, if discovered.
    pub fn terminal(&self) -> Option<CharacteristicId> {
        self.router.terminal
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn events(&self) -> &E {
        &self.router.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.router.events
    }

    /// Decompose the node into its link, delay and event sink.
    pub fn into_parts(self) -> (L, D, E) {
        (self.link, self.delay, self.router.events)
    }
}

/// Run `fut`, giving up after `timeout_ms`.
async fn with_timeout<D: DelayNs, F: Future>(
    delay: &mut D,
    timeout_ms: u32,
    fut: F,
) -> Option<F::Output> {
    match select(fut, delay.delay_ms(timeout_ms)).await {
        Either::First(output) => Some(output),
        Either::Second(()) => None,
    }
}

/// Wait up to `timeout_ms` for a terminal notification during an upgrade.
///
/// `Ok(None)` means the time ran out. Cancellation wins over the timeout.
async fn await_terminal<L: DeviceLink, D: DelayNs, E: EventSink>(
    link: &mut L,
    delay: &mut D,
    router: &mut Router<E>,
    terminal: CharacteristicId,
    buf: &mut [u8],
    timeout_ms: u32,
    cancel: &CancelToken,
) -> Result<Option<usize>, TransferError> {
    match select3(
        next_terminal(link, router, terminal, buf),
        cancel.cancelled(),
        delay.delay_ms(timeout_ms),
    )
    .await
    {
        Either3::First(len) => Ok(Some(len?)),
        Either3::Second(()) => Err(TransferError::Cancelled),
        Either3::Third(()) => Ok(None),
    }
}

/// Wait for the next terminal notification, routing everything else.
async fn next_terminal<L: DeviceLink, E: EventSink>(
    link: &mut L,
    router: &mut Router<E>,
    terminal: CharacteristicId,
    buf: &mut [u8],
) -> Result<usize, LinkError> {
    loop {
        let notification = link.receive(buf).await?;
        let len = notification.len.min(buf.len());
        if notification.characteristic == terminal {
            return Ok(len);
        }
        router.dispatch(notification.characteristic, &buf[..len]);
    }
}

/// Collect terminal notifications until a full reply has arrived.
async fn read_response<L: DeviceLink, E: EventSink, const N: usize>(
    link: &mut L,
    router: &mut Router<E>,
    terminal: CharacteristicId,
    response: &mut ResponseAccumulator<N>,
    buf: &mut [u8],
) -> Result<(), NodeError> {
    loop {
        let len = next_terminal(link, router, terminal, buf).await?;
        if response.push(&buf[..len])? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::link::{Characteristics, DiscoveredCharacteristic, Notification, Properties};
    use crate::transfer::Progress;
    use bluest_proto::feature::{MASK_ACCELEROMETER, MASK_GYROSCOPE, MASK_SWITCH, MASK_TEMPERATURE};
    use bluest_proto::firmware::UpgradeCommand;
    use bluest_proto::Reading;
    use core::pin::Pin;
    use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
    use std::boxed::Box;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::vec;
    use std::vec::Vec as StdVec;
    use uuid::Uuid;

    const MOTION: CharacteristicId = CharacteristicId(0x10);
    const ENV: CharacteristicId = CharacteristicId(0x20);
    const SWITCH: CharacteristicId = CharacteristicId(0x30);
    const TERMINAL: CharacteristicId = CharacteristicId(0x40);
    const STDERR: CharacteristicId = CharacteristicId(0x41);
    const BATTERY_SERVICE: CharacteristicId = CharacteristicId(0x50);

    type Reply = (CharacteristicId, StdVec<u8>);
    type Script = Box<dyn FnMut(CharacteristicId, &[u8]) -> StdVec<Reply>>;

    struct MockLink {
        inbox: VecDeque<Reply>,
        writes: StdVec<(CharacteristicId, StdVec<u8>, WriteMode)>,
        notify: StdVec<(CharacteristicId, bool)>,
        reconnects: usize,
        connected: bool,
        // Writes beyond this count fail.
        write_limit: Option<usize>,
        script: Script,
    }

    impl MockLink {
        fn new(script: Script) -> Self {
            Self {
                inbox: VecDeque::new(),
                writes: StdVec::new(),
                notify: StdVec::new(),
                reconnects: 0,
                connected: true,
                write_limit: None,
                script,
            }
        }

        fn silent() -> Self {
            Self::new(Box::new(|_, _| StdVec::new()))
        }

        fn chunk_writes(&self) -> StdVec<usize> {
            self.writes
                .iter()
                .filter(|(_, _, mode)| *mode == WriteMode::WithoutResponse)
                .map(|(_, data, _)| data.len())
                .collect()
        }
    }

    fn characteristic(id: CharacteristicId, service: Uuid, uuid: Uuid) -> DiscoveredCharacteristic {
        DiscoveredCharacteristic {
            id,
            service,
            uuid,
            properties: Properties::READ | Properties::NOTIFY,
        }
    }

    impl DeviceLink for MockLink {
        fn discover(&mut self) -> impl Future<Output = Result<Characteristics, LinkError>> {
            let feature_service = uuids::feature_service(0);
            let mut found = Characteristics::new();
            for c in [
                characteristic(MOTION, feature_service, uuids::feature_characteristic(0x00C0_0000)),
                characteristic(ENV, feature_service, uuids::feature_characteristic(0x001C_0000)),
                characteristic(SWITCH, feature_service, uuids::feature_characteristic(MASK_SWITCH)),
                characteristic(TERMINAL, uuids::DEBUG_SERVICE, uuids::DEBUG_TERMINAL),
                characteristic(STDERR, uuids::DEBUG_SERVICE, uuids::DEBUG_STDERR),
                // Standard battery service: not a feature service.
                characteristic(
                    BATTERY_SERVICE,
                    Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb),
                    Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb),
                ),
            ] {
                found.push(c).unwrap();
            }
            core::future::ready(Ok(found))
        }

        fn set_notify(
            &mut self,
            characteristic: CharacteristicId,
            enabled: bool,
        ) -> impl Future<Output = Result<(), LinkError>> {
            self.notify.push((characteristic, enabled));
            core::future::ready(Ok(()))
        }

        fn write(
            &mut self,
            characteristic: CharacteristicId,
            data: &[u8],
            mode: WriteMode,
        ) -> impl Future<Output = Result<(), LinkError>> {
            let result = if !self.connected {
                Err(LinkError::Disconnected)
            } else if self.write_limit.is_some_and(|limit| self.writes.len() >= limit) {
                Err(LinkError::Write)
            } else {
                self.writes.push((characteristic, data.to_vec(), mode));
                let replies = (self.script)(characteristic, data);
                self.inbox.extend(replies);
                Ok(())
            };
            core::future::ready(result)
        }

        fn receive(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<Notification, LinkError>> {
            core::future::poll_fn(move |_| match self.inbox.pop_front() {
                Some((characteristic, data)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Poll::Ready(Ok(Notification {
                        characteristic,
                        len,
                    }))
                }
                None => Poll::Pending,
            })
        }

        fn reconnect(&mut self) -> impl Future<Output = Result<(), LinkError>> {
            self.reconnects += 1;
            core::future::ready(Ok(()))
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    // Delay that completes immediately and records what was asked for.
    #[derive(Default)]
    struct MockDelay {
        waits_ms: StdVec<u32>,
    }

    impl DelayNs for MockDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.waits_ms.push(ns / 1_000_000);
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.waits_ms.push(ms);
        }
    }

    type TestNode = BlueStNode<MockLink, MockDelay, StdVec<Event>>;

    fn node(link: MockLink) -> TestNode {
        let mut node = BlueStNode::new(link, MockDelay::default(), StdVec::new());
        block_on(node.discover()).unwrap();
        node.events_mut().clear();
        node
    }

    // Node side of the upgrade handshake.
    fn upgrade_script(echo_crc: impl Fn(u32) -> u32 + 'static) -> Script {
        let mut expected = 0usize;
        let mut received = 0usize;
        Box::new(move |id, data| {
            if id != TERMINAL {
                return StdVec::new();
            }
            if let Some(command) = UpgradeCommand::parse(data) {
                expected = command.length as usize;
                received = 0;
                return vec![(TERMINAL, echo_crc(command.crc).to_le_bytes().to_vec())];
            }
            received += data.len();
            if received == expected {
                vec![(TERMINAL, vec![0x01])]
            } else {
                StdVec::new()
            }
        })
    }

    fn image(len: usize) -> StdVec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(5)).collect()
    }

    fn feature(channel: CharacteristicId, mask: u32) -> FeatureRef {
        FeatureRef { channel, mask }
    }

    // Helper to run a future to completion (simple blocking executor)
    fn block_on<F: Future>(mut f: F) -> F::Output {
        fn noop_raw_waker() -> RawWaker {
            fn noop(_: *const ()) {}
            fn clone(_: *const ()) -> RawWaker {
                noop_raw_waker()
            }
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
            RawWaker::new(core::ptr::null(), &VTABLE)
        }

        let waker = unsafe { Waker::from_raw(noop_raw_waker()) };
        let mut cx = Context::from_waker(&waker);

        // SAFETY: We don't move f after pinning
        let mut f = unsafe { Pin::new_unchecked(&mut f) };

        match f.as_mut().poll(&mut cx) {
            Poll::Ready(result) => result,
            Poll::Pending => panic!("Mock future returned Pending unexpectedly"),
        }
    }

    #[test]
    fn test_discover_binds_feature_characteristics() {
        let mut node = BlueStNode::new(MockLink::silent(), MockDelay::default(), StdVec::<Event>::new());
        let bound = block_on(node.discover()).unwrap();

        // Accel + gyro, pressure + humidity + temperature, switch.
        assert_eq!(bound, 6);
        assert_eq!(node.channels().len(), 3);
        assert_eq!(node.terminal(), Some(TERMINAL));
        assert!(node.channels().get(BATTERY_SERVICE).is_none());

        let discovered: StdVec<_> = node
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::FeatureDiscovered { name, .. } => Some(*name),
                _ => None,
            })
            .collect();
        assert_eq!(
            discovered,
            ["Accelerometer", "Gyroscope", "Pressure", "Humidity", "Temperature", "Switch"]
        );
    }

    #[test]
    fn test_enable_subscribes_once_per_channel() {
        let mut node = node(MockLink::silent());

        block_on(node.enable_feature(feature(MOTION, MASK_ACCELEROMETER))).unwrap();
        block_on(node.enable_feature(feature(MOTION, MASK_GYROSCOPE))).unwrap();
        block_on(node.disable_feature(feature(MOTION, MASK_ACCELEROMETER))).unwrap();
        block_on(node.disable_feature(feature(MOTION, MASK_GYROSCOPE))).unwrap();

        assert_eq!(node.link().notify, [(MOTION, true), (MOTION, false)]);
        assert_eq!(
            block_on(node.enable_feature(feature(MOTION, MASK_TEMPERATURE))),
            Err(NodeError::Channel(ChannelError::UnknownFeature))
        );
        assert_eq!(
            block_on(node.enable_feature(feature(CharacteristicId(99), MASK_TEMPERATURE))),
            Err(NodeError::Channel(ChannelError::UnknownChannel))
        );
    }

    #[test]
    fn test_enable_all() {
        let mut node = node(MockLink::silent());
        assert_eq!(block_on(node.enable_all()), Ok(6));
        assert_eq!(node.link().notify.len(), 3);
    }

    #[test]
    fn test_notification_emits_values_for_enabled_features() {
        let mut node = node(MockLink::silent());
        block_on(node.enable_feature(feature(ENV, MASK_TEMPERATURE))).unwrap();

        // ts | pressure u32 | humidity i16 | temperature i16 (25.0 C)
        let mut payload = vec![0u8; 10];
        payload[8..10].copy_from_slice(&250i16.to_le_bytes());
        node.link_mut().inbox.push_back((ENV, payload));
        block_on(node.process_one()).unwrap();

        assert_eq!(
            node.events().as_slice(),
            [Event::ValueUpdated {
                feature: feature(ENV, MASK_TEMPERATURE),
                value: Reading::Scalar(77.0),
            }]
        );
    }

    #[test]
    fn test_stderr_becomes_status_message() {
        let mut node = node(MockLink::silent());
        node.handle_notification(STDERR, b"HardFault\r\n");
        assert!(matches!(
            node.events().as_slice(),
            [Event::StatusMessage(text)] if text.as_str() == "HardFault"
        ));
    }

    #[test]
    fn test_toggle_switch_inverts_last_value() {
        let mut node = node(MockLink::silent());
        let switch = feature(SWITCH, MASK_SWITCH);

        block_on(node.toggle_switch(switch)).unwrap();

        block_on(node.enable_feature(switch)).unwrap();
        node.handle_notification(SWITCH, &[0, 0, 1]);
        block_on(node.toggle_switch(switch)).unwrap();

        let writes = &node.link().writes;
        assert_eq!(writes[0], (SWITCH, vec![0x20, 0, 0, 0, 1], WriteMode::WithResponse));
        assert_eq!(writes[1], (SWITCH, vec![0x20, 0, 0, 0, 0], WriteMode::WithResponse));

        assert_eq!(
            block_on(node.toggle_switch(feature(ENV, MASK_TEMPERATURE))),
            Err(NodeError::NoCommand)
        );
    }

    #[test]
    fn test_query_version_accumulates_fragments() {
        let link = MockLink::new(Box::new(|id, data| {
            if id == TERMINAL && data == b"versionFw\r\n" {
                vec![
                    (TERMINAL, b"SensiBLE_".to_vec()),
                    (MOTION, vec![0; 14]),
                    (TERMINAL, b"SIMBA_2.1.0\r\n".to_vec()),
                ]
            } else {
                StdVec::new()
            }
        }));
        let mut node = node(link);

        let version = block_on(node.query_version()).unwrap();
        assert_eq!(version.name.as_str(), "SensiBLE");
        assert_eq!(version.mcu_type.as_str(), "SIMBA");
        assert_eq!((version.major, version.minor, version.patch), (2, 1, 0));

        assert_eq!(node.link().notify, [(TERMINAL, true), (TERMINAL, false)]);
        assert_eq!(node.events().as_slice(), [Event::VersionReported(version)]);
    }

    #[test]
    fn test_query_version_malformed_reply_is_status() {
        let link = MockLink::new(Box::new(|id, _| {
            if id == TERMINAL {
                vec![(TERMINAL, b"Unknown command\r\n".to_vec())]
            } else {
                StdVec::new()
            }
        }));
        let mut node = node(link);

        assert_eq!(
            block_on(node.query_version()),
            Err(NodeError::Terminal(TerminalError::Malformed))
        );
        assert!(matches!(
            node.events().as_slice(),
            [Event::StatusMessage(text)] if text.as_str() == "Unknown command"
        ));
    }

    #[test]
    fn test_query_version_times_out() {
        let mut node = node(MockLink::silent());
        assert_eq!(block_on(node.query_version()), Err(NodeError::Timeout));

        let (_, delay, _) = node.into_parts();
        assert_eq!(delay.waits_ms, [DEFAULT_TERMINAL_CONFIG.response_timeout_ms]);
    }

    #[test]
    fn test_upgrade_forty_bytes() {
        let mut node = node(MockLink::new(upgrade_script(|crc| crc)));
        let content = image(40);

        block_on(node.upgrade(&content, &CancelToken::new())).unwrap();

        let link = node.link();
        assert_eq!(link.writes[0].2, WriteMode::WithResponse);
        assert!(link.writes[0].1.starts_with(b"upgradeFw"));
        assert_eq!(link.writes[0].1.len(), 17);
        assert_eq!(link.chunk_writes(), [16, 16, 8]);
        assert_eq!(link.reconnects, 1);
        assert_eq!(node.events().as_slice(), [Event::TransferCompleted]);
        assert_eq!(node.terminal(), None);

        let (_, delay, _) = node.into_parts();
        assert_eq!(delay.waits_ms, [11, 11, 11, DEFAULT_TRANSFER_CONFIG.reboot_grace_ms]);
    }

    #[test]
    fn test_upgrade_reports_progress() {
        let mut node = node(MockLink::new(upgrade_script(|crc| crc)));
        let content = image(16 * 12);

        block_on(node.upgrade(&content, &CancelToken::new())).unwrap();

        assert_eq!(
            node.events().as_slice(),
            [
                Event::TransferProgress(Progress {
                    bytes_sent: 160,
                    packets_sent: 10,
                    total: 192,
                }),
                Event::TransferCompleted,
            ]
        );
    }

    #[test]
    fn test_upgrade_crc_mismatch() {
        let mut node = node(MockLink::new(upgrade_script(|crc| crc.wrapping_add(1))));
        let content = image(40);

        let result = block_on(node.upgrade(&content, &CancelToken::new()));

        assert!(matches!(result, Err(TransferError::ChecksumMismatch { .. })));
        assert!(node.link().chunk_writes().is_empty());
        assert_eq!(node.link().reconnects, 0);
        assert!(matches!(
            node.events().as_slice(),
            [Event::TransferFailed(TransferError::ChecksumMismatch { .. })]
        ));
    }

    #[test]
    fn test_upgrade_times_out_without_crc_echo() {
        let mut node = node(MockLink::silent());
        let content = image(40);

        assert_eq!(
            block_on(node.upgrade(&content, &CancelToken::new())),
            Err(TransferError::Timeout)
        );
        assert_eq!(node.events().as_slice(), [Event::TransferFailed(TransferError::Timeout)]);
    }

    #[test]
    fn test_upgrade_times_out_without_completion_ack() {
        let link = MockLink::new(Box::new(|id, data| match UpgradeCommand::parse(data) {
            Some(command) if id == TERMINAL => vec![(TERMINAL, command.crc.to_le_bytes().to_vec())],
            _ => StdVec::new(),
        }));
        let mut node = node(link);

        assert_eq!(
            block_on(node.upgrade(&image(40), &CancelToken::new())),
            Err(TransferError::Timeout)
        );
        assert_eq!(node.link().chunk_writes(), [16, 16, 8]);
        assert_eq!(node.link().reconnects, 0);
        assert_eq!(node.events().as_slice(), [Event::TransferFailed(TransferError::Timeout)]);

        let (_, delay, _) = node.into_parts();
        assert_eq!(
            delay.waits_ms,
            [11, 11, 11, DEFAULT_TRANSFER_CONFIG.completion_ack_timeout_ms]
        );
    }

    #[test]
    fn test_upgrade_write_failure_aborts() {
        let mut link = MockLink::new(upgrade_script(|crc| crc));
        // Command frame and first chunk only.
        link.write_limit = Some(2);
        let mut node = node(link);

        assert_eq!(
            block_on(node.upgrade(&image(40), &CancelToken::new())),
            Err(TransferError::Link(LinkError::Write))
        );
        assert_eq!(node.link().chunk_writes(), [16]);
        assert_eq!(node.link().reconnects, 0);
        assert_eq!(
            node.events().as_slice(),
            [Event::TransferFailed(TransferError::Link(LinkError::Write))]
        );
    }

    #[test]
    fn test_upgrade_cancelled_before_start() {
        let mut node = node(MockLink::new(upgrade_script(|crc| crc)));
        let cancel = CancelToken::new();
        cancel.cancel();

        assert_eq!(block_on(node.upgrade(&image(40), &cancel)), Err(TransferError::Cancelled));
        assert!(node.link().writes.is_empty());
        assert!(node.link().notify.is_empty());
        assert_eq!(node.events().as_slice(), [Event::TransferFailed(TransferError::Cancelled)]);
    }

    #[test]
    fn test_upgrade_cancelled_while_awaiting_crc_echo() {
        let cancel = Rc::new(CancelToken::new());
        let token = Rc::clone(&cancel);
        // The node stays silent; the user gives up instead.
        let mut node = node(MockLink::new(Box::new(move |_, _| {
            token.cancel();
            StdVec::new()
        })));

        assert_eq!(block_on(node.upgrade(&image(40), &cancel)), Err(TransferError::Cancelled));
        assert_eq!(node.link().writes.len(), 1);
        assert!(node.link().chunk_writes().is_empty());

        let (_, delay, _) = node.into_parts();
        assert!(delay.waits_ms.is_empty());
    }

    #[test]
    fn test_upgrade_cancelled_mid_upload() {
        let cancel = Rc::new(CancelToken::new());
        let token = Rc::clone(&cancel);
        let mut inner = upgrade_script(|crc| crc);
        let link = MockLink::new(Box::new(move |id, data| {
            if UpgradeCommand::parse(data).is_none() {
                token.cancel();
            }
            inner(id, data)
        }));
        let mut node = node(link);

        assert_eq!(block_on(node.upgrade(&image(40), &cancel)), Err(TransferError::Cancelled));
        assert_eq!(node.link().chunk_writes(), [16]);
        assert_eq!(node.link().reconnects, 0);

        let (_, delay, _) = node.into_parts();
        assert_eq!(delay.waits_ms, [11]);
    }

    #[test]
    fn test_upgrade_rejected_mid_upload() {
        let link = MockLink::new(Box::new(|id, data| {
            if id != TERMINAL {
                return StdVec::new();
            }
            match UpgradeCommand::parse(data) {
                Some(command) => vec![(TERMINAL, command.crc.to_le_bytes().to_vec())],
                None => vec![(TERMINAL, b"Flash error\r\n".to_vec())],
            }
        }));
        let mut node = node(link);
        let content = image(64);

        assert_eq!(
            block_on(node.upgrade(&content, &CancelToken::new())),
            Err(TransferError::Rejected)
        );
        assert_eq!(node.link().chunk_writes(), [16]);
        assert!(matches!(
            node.events().as_slice(),
            [Event::StatusMessage(text), Event::TransferFailed(TransferError::Rejected)]
                if text.as_str() == "Flash error"
        ));
    }

    #[test]
    fn test_sensor_data_routed_during_upgrade() {
        let mut inner = upgrade_script(|crc| crc);
        let link = MockLink::new(Box::new(move |id, data| {
            let mut replies = vec![(MOTION, vec![0, 0, 10, 0, 20, 0, 30, 0, 0, 0, 0, 0, 0, 0])];
            replies.extend(inner(id, data));
            replies
        }));
        let mut node = node(link);
        block_on(node.enable_feature(feature(MOTION, MASK_ACCELEROMETER))).unwrap();

        block_on(node.upgrade(&image(20), &CancelToken::new())).unwrap();

        let values = node
            .events()
            .iter()
            .filter(|e| matches!(e, Event::ValueUpdated { .. }))
            .count();
        // One sample per write: command frame and two chunks.
        assert_eq!(values, 3);
    }

    #[test]
    fn test_upgrade_needs_terminal_and_connection() {
        let mut bare = BlueStNode::new(MockLink::silent(), MockDelay::default(), StdVec::<Event>::new());
        assert_eq!(
            block_on(bare.upgrade(&image(8), &CancelToken::new())),
            Err(TransferError::Link(LinkError::MissingCharacteristic))
        );

        let mut node = node(MockLink::silent());
        node.link_mut().connected = false;
        assert_eq!(
            block_on(node.upgrade(&image(8), &CancelToken::new())),
            Err(TransferError::Link(LinkError::Disconnected))
        );
        assert_eq!(
            block_on(node.query_version()),
            Err(NodeError::Link(LinkError::Disconnected))
        );
    }
}
