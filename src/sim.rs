//! In-process BlueST node.
//!
//! [`SimulatedNode`] implements [`DeviceLink`] the way a SensiBLE board
//! behaves over GATT: a feature service with three multiplexed
//! characteristics, and the debug service with its terminal and stderr
//! streams. It answers `versionFw`, runs the firmware upgrade handshake
//! (checksumming the received image with the same CRC the host uses) and
//! produces sensor samples on a fixed period once notifications are on.

use std::collections::VecDeque;

use bluest_core::{
    CharacteristicId, Characteristics, DeviceLink, DiscoveredCharacteristic, LinkError,
    Notification, Properties, WriteMode,
};
use bluest_proto::crc::{Crc32Digest, CRC32_WORD};
use bluest_proto::feature::SWITCH_COMMAND_PREFIX;
use bluest_proto::firmware::{UpgradeCommand, ACK_COMPLETE};
use bluest_proto::terminal::{LINE_END, VERSION_COMMAND};
use bluest_proto::uuids;
use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, warn};

/// Accelerometer, gyroscope, magnetometer.
pub const MOTION: CharacteristicId = CharacteristicId(0x0010);
/// Pressure, humidity, temperature, battery.
pub const ENVIRONMENT: CharacteristicId = CharacteristicId(0x0013);
pub const SWITCH: CharacteristicId = CharacteristicId(0x0016);
pub const TERMINAL: CharacteristicId = CharacteristicId(0x0020);
pub const STDERR: CharacteristicId = CharacteristicId(0x0023);

pub const MOTION_MASK: u32 = 0x00E0_0000;
pub const ENVIRONMENT_MASK: u32 = 0x001E_0000;
pub const SWITCH_MASK: u32 = 0x2000_0000;

/// How the simulated node identifies and behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    pub name: &'static str,
    pub mcu_type: &'static str,
    pub version: (u16, u16, u16),
    /// Period between sensor samples.
    pub sample_period_ms: u64,
    /// Echo a wrong checksum to the upgrade command.
    pub corrupt_crc_echo: bool,
}

pub const DEFAULT_SIM_CONFIG: SimConfig = SimConfig {
    name: "SensiBLE",
    mcu_type: "SIMBA",
    version: (2, 1, 0),
    sample_period_ms: 100,
    corrupt_crc_echo: false,
};

impl Default for SimConfig {
    fn default() -> Self {
        DEFAULT_SIM_CONFIG
    }
}

/// An image being received.
struct Incoming {
    command: UpgradeCommand,
    received: u32,
    digest: Crc32Digest,
    word: [u8; CRC32_WORD],
    word_len: usize,
}

impl Incoming {
    fn new(command: UpgradeCommand) -> Self {
        Self {
            command,
            received: 0,
            digest: Crc32Digest::new(),
            word: [0; CRC32_WORD],
            word_len: 0,
        }
    }

    /// Feed received bytes; trailing bytes short of a word are not summed.
    fn extend(&mut self, data: &[u8]) {
        for &byte in data {
            self.word[self.word_len] = byte;
            self.word_len += 1;
            if self.word_len == CRC32_WORD {
                self.digest.update_word(u32::from_le_bytes(self.word));
                self.word_len = 0;
            }
        }
        self.received += data.len() as u32;
    }

    fn is_complete(&self) -> bool {
        self.received >= self.command.length
    }
}

/// A BlueST node living in the host process.
pub struct SimulatedNode {
    config: SimConfig,
    connected: bool,
    notifying: Vec<CharacteristicId>,
    outbox: VecDeque<(CharacteristicId, Vec<u8>)>,
    incoming: Option<Incoming>,
    rebooting: bool,
    switch_on: bool,
    tick: u16,
    next_sample: Instant,
    installed: Vec<u32>,
}

impl SimulatedNode {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            connected: true,
            notifying: Vec::new(),
            outbox: VecDeque::new(),
            incoming: None,
            rebooting: false,
            switch_on: false,
            tick: 0,
            next_sample: Instant::now(),
            installed: Vec::new(),
        }
    }

    /// Checksums of every image accepted so far.
    pub fn installed(&self) -> &[u32] {
        &self.installed
    }

    pub fn is_notifying(&self, characteristic: CharacteristicId) -> bool {
        self.notifying.contains(&characteristic)
    }

    pub fn switch_on(&self) -> bool {
        self.switch_on
    }

    /// Drop the connection as if the node went out of range.
    pub fn disconnect(&mut self) {
        info!("simulated node disconnected");
        self.connected = false;
        self.notifying.clear();
        self.outbox.clear();
        self.incoming = None;
    }

    fn notify(&mut self, characteristic: CharacteristicId, data: &[u8]) {
        if self.is_notifying(characteristic) {
            self.outbox.push_back((characteristic, data.to_vec()));
        } else {
            debug!("{:?} not notifying, dropping {} bytes", characteristic, data.len());
        }
    }

    fn terminal_line(&mut self, text: &str) {
        let mut line = Vec::with_capacity(text.len() + LINE_END.len());
        line.extend_from_slice(text.as_bytes());
        line.extend_from_slice(LINE_END.as_bytes());
        self.notify(TERMINAL, &line);
    }

    fn on_terminal_write(&mut self, data: &[u8]) {
        if let Some(command) = UpgradeCommand::parse(data) {
            info!(
                "upgrade announced: {} bytes, crc {:#010x}",
                command.length, command.crc
            );
            let echo = if self.config.corrupt_crc_echo {
                command.crc ^ 0xFFFF_FFFF
            } else {
                command.crc
            };
            self.incoming = Some(Incoming::new(command));
            self.notify(TERMINAL, &echo.to_le_bytes());
            return;
        }

        if let Some(incoming) = self.incoming.as_mut() {
            incoming.extend(data);
            if incoming.is_complete() {
                self.finish_image();
            }
            return;
        }

        let command = data.strip_suffix(LINE_END.as_bytes()).unwrap_or(data);
        if command == VERSION_COMMAND.as_bytes() {
            let (major, minor, patch) = self.config.version;
            let reply = format!(
                "{}_{}_{}.{}.{}",
                self.config.name,
                self.config.mcu_type,
                major,
                minor,
                patch
            );
            // Real nodes split long replies across notifications.
            let (head, tail) = reply.as_bytes().split_at(reply.len() / 2);
            let mut line = tail.to_vec();
            line.extend_from_slice(LINE_END.as_bytes());
            self.notify(TERMINAL, head);
            self.notify(TERMINAL, &line);
        } else {
            let text = String::from_utf8_lossy(command).into_owned();
            self.terminal_line(&format!("Command not found: {text}"));
        }
    }

    fn finish_image(&mut self) {
        let Some(incoming) = self.incoming.take() else {
            return;
        };
        let expected = incoming.command.crc;
        let actual = incoming.digest.finalize();

        if actual == expected {
            info!("image accepted, rebooting");
            self.installed.push(actual);
            self.notify(TERMINAL, &[ACK_COMPLETE]);
            self.rebooting = true;
        } else {
            warn!("image checksum {:#010x}, announced {:#010x}", actual, expected);
            self.notify(STDERR, b"flash: checksum error\r\n");
            self.terminal_line("Upgrade failed");
        }
    }

    fn on_switch_write(&mut self, data: &[u8]) {
        match data.split_last() {
            Some((&value, prefix)) if prefix == SWITCH_COMMAND_PREFIX => {
                self.switch_on = value != 0;
                info!("switch {}", if self.switch_on { "on" } else { "off" });
                let sample = self.switch_sample();
                self.notify(SWITCH, &sample);
            }
            _ => warn!("unexpected switch write {:02x?}", data),
        }
    }

    fn switch_sample(&self) -> [u8; 3] {
        let [ts0, ts1] = self.tick.to_le_bytes();
        [ts0, ts1, u8::from(self.switch_on)]
    }

    /// Queue one sample on every notifying feature characteristic.
    fn sample(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let t = i16::try_from(self.tick % 200).unwrap_or(0) - 100;

        let mut motion = Vec::with_capacity(20);
        motion.extend_from_slice(&self.tick.to_le_bytes());
        for value in [t, -t, 1000, t * 3, 0, -t * 2, 400, -220, 35] {
            motion.extend_from_slice(&value.to_le_bytes());
        }
        self.notify(MOTION, &motion);

        let mut environment = Vec::with_capacity(17);
        environment.extend_from_slice(&self.tick.to_le_bytes());
        environment.extend_from_slice(&(100_956u32 + u32::from(self.tick % 50)).to_le_bytes());
        environment.extend_from_slice(&455i16.to_le_bytes());
        environment.extend_from_slice(&(250i16 + t / 10).to_le_bytes());
        environment.extend_from_slice(&875u16.to_le_bytes());
        environment.extend_from_slice(&3_900i16.to_le_bytes());
        environment.extend_from_slice(&(-120i16).to_le_bytes());
        environment.push(0x01);
        self.notify(ENVIRONMENT, &environment);

        let switch = self.switch_sample();
        self.notify(SWITCH, &switch);
    }

    fn has_sensor_subscription(&self) -> bool {
        self.notifying
            .iter()
            .any(|id| [MOTION, ENVIRONMENT, SWITCH].contains(id))
    }
}

impl Default for SimulatedNode {
    fn default() -> Self {
        Self::new(DEFAULT_SIM_CONFIG)
    }
}

fn characteristic(
    id: CharacteristicId,
    service: uuid::Uuid,
    uuid: uuid::Uuid,
    properties: Properties,
) -> DiscoveredCharacteristic {
    DiscoveredCharacteristic {
        id,
        service,
        uuid,
        properties,
    }
}

impl DeviceLink for SimulatedNode {
    async fn discover(&mut self) -> Result<Characteristics, LinkError> {
        if !self.connected {
            return Err(LinkError::Disconnected);
        }
        let feature = uuids::feature_service(0);
        let sensor = Properties::READ | Properties::NOTIFY;
        let mut found = Characteristics::new();
        for c in [
            characteristic(MOTION, feature, uuids::feature_characteristic(MOTION_MASK), sensor),
            characteristic(
                ENVIRONMENT,
                feature,
                uuids::feature_characteristic(ENVIRONMENT_MASK),
                sensor,
            ),
            characteristic(
                SWITCH,
                feature,
                uuids::feature_characteristic(SWITCH_MASK),
                sensor | Properties::WRITE,
            ),
            characteristic(
                TERMINAL,
                uuids::DEBUG_SERVICE,
                uuids::DEBUG_TERMINAL,
                Properties::READ
                    | Properties::WRITE
                    | Properties::WRITE_WITHOUT_RESPONSE
                    | Properties::NOTIFY,
            ),
            characteristic(STDERR, uuids::DEBUG_SERVICE, uuids::DEBUG_STDERR, sensor),
        ] {
            found.push(c).map_err(|_| LinkError::Discovery)?;
        }
        Ok(found)
    }

    async fn set_notify(
        &mut self,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::Disconnected);
        }
        if enabled {
            if !self.notifying.contains(&characteristic) {
                if !self.has_sensor_subscription() {
                    self.next_sample = Instant::now();
                }
                self.notifying.push(characteristic);
            }
        } else {
            self.notifying.retain(|id| *id != characteristic);
        }
        Ok(())
    }

    async fn write(
        &mut self,
        characteristic: CharacteristicId,
        data: &[u8],
        _mode: WriteMode,
    ) -> Result<(), LinkError> {
        if !self.connected || self.rebooting {
            return Err(LinkError::Disconnected);
        }
        match characteristic {
            TERMINAL => self.on_terminal_write(data),
            SWITCH => self.on_switch_write(data),
            other => {
                warn!("write to read-only characteristic {:?}", other);
                return Err(LinkError::Write);
            }
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<Notification, LinkError> {
        loop {
            if let Some((characteristic, data)) = self.outbox.pop_front() {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                return Ok(Notification {
                    characteristic,
                    len,
                });
            }
            if !self.connected {
                return Err(LinkError::Disconnected);
            }
            if self.rebooting {
                self.disconnect();
                return Err(LinkError::Disconnected);
            }
            if !self.has_sensor_subscription() {
                core::future::pending::<()>().await;
            }

            Timer::at(self.next_sample).await;
            self.next_sample += Duration::from_millis(self.config.sample_period_ms);
            self.sample();
        }
    }

    async fn reconnect(&mut self) -> Result<(), LinkError> {
        info!("simulated node reconnected");
        self.connected = true;
        self.rebooting = false;
        self.notifying.clear();
        self.outbox.clear();
        self.incoming = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.rebooting
    }
}
