//! Debug terminal text protocol.
//!
//! Commands are ISO-Latin-1 text terminated by `\r\n`. Responses may be split
//! across several notifications; a response is complete once the accumulated
//! text ends with `\r\n`.
//!
//! The version query answers with a line of the form
//! `name_mcuType_major.minor.patch`.

use core::fmt;

use heapless::{String, Vec};

/// Line terminator for commands and responses.
pub const LINE_END: &str = "\r\n";

/// Query the running firmware version.
pub const VERSION_COMMAND: &str = "versionFw";

/// Longest command accepted by [`encode_command`], terminator included.
pub const MAX_COMMAND_LEN: usize = 64;

/// Default capacity of a [`ResponseAccumulator`].
pub const MAX_RESPONSE_LEN: usize = 256;

/// Capacity of the name and MCU fields of a [`FirmwareVersion`].
pub const MAX_VERSION_FIELD: usize = 32;

/// Error type for terminal text handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TerminalError {
    /// Command contains a character outside ISO-Latin-1.
    NotLatin1,
    /// Command or response does not fit the buffer.
    Overflow,
    /// Response text does not have the expected shape.
    Malformed,
}

impl fmt::Display for TerminalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminalError::NotLatin1 => "command is not ISO-Latin-1 text",
            TerminalError::Overflow => "terminal text exceeds buffer",
            TerminalError::Malformed => "malformed terminal response",
        })
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TerminalError {}

/// Encode `command` as Latin-1 bytes followed by `\r\n`.
///
/// # Example
///
/// ```
/// use bluest_proto::terminal::{encode_command, VERSION_COMMAND};
///
/// let bytes = encode_command(VERSION_COMMAND).unwrap();
/// assert_eq!(&bytes[..], b"versionFw\r\n");
/// ```
pub fn encode_command(command: &str) -> Result<Vec<u8, MAX_COMMAND_LEN>, TerminalError> {
    let mut out = Vec::new();
    for ch in command.chars().chain(LINE_END.chars()) {
        let byte = u8::try_from(u32::from(ch)).map_err(|_| TerminalError::NotLatin1)?;
        out.push(byte).map_err(|_| TerminalError::Overflow)?;
    }
    Ok(out)
}

/// Decode Latin-1 bytes into `out`, one char per byte.
pub fn decode_latin1<const N: usize>(data: &[u8], out: &mut String<N>) -> Result<(), TerminalError> {
    for &byte in data {
        out.push(char::from(byte))
            .map_err(|_| TerminalError::Overflow)?;
    }
    Ok(())
}

/// Collects response fragments until a full `\r\n`-terminated reply arrives.
pub struct ResponseAccumulator<const N: usize = MAX_RESPONSE_LEN> {
    text: String<N>,
}

impl<const N: usize> ResponseAccumulator<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            text: String::new(),
        }
    }

    /// Append one notification. Returns `true` once the reply is complete.
    ///
    /// On overflow the partial text is discarded so the next reply starts
    /// clean.
    pub fn push(&mut self, data: &[u8]) -> Result<bool, TerminalError> {
        if let Err(e) = decode_latin1(data, &mut self.text) {
            self.text.clear();
            return Err(e);
        }
        Ok(self.is_complete())
    }

    /// Whether the accumulated text ends with the line terminator.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.text.ends_with(LINE_END)
    }

    /// Accumulated text so far.
    #[inline]
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

impl<const N: usize> Default for ResponseAccumulator<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Firmware identification reported by the version query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub name: String<MAX_VERSION_FIELD>,
    pub mcu_type: String<MAX_VERSION_FIELD>,
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl FirmwareVersion {
    /// Parse the first line of a version response.
    ///
    /// Both text fields are greedy: the version starts at the last `_` that
    /// is followed by `digits.digits.digits`, and the name ends at the last
    /// `_` before that. Anything after the patch number is ignored.
    ///
    /// # Example
    ///
    /// ```
    /// use bluest_proto::terminal::FirmwareVersion;
    ///
    /// let v = FirmwareVersion::parse("SensiBLE_SIMBA_1.2.10\r\n").unwrap();
    /// assert_eq!(v.name.as_str(), "SensiBLE");
    /// assert_eq!(v.mcu_type.as_str(), "SIMBA");
    /// assert_eq!((v.major, v.minor, v.patch), (1, 2, 10));
    /// ```
    pub fn parse(text: &str) -> Result<Self, TerminalError> {
        let line = text
            .split(['\r', '\n'])
            .next()
            .unwrap_or_default();

        let (version_sep, numbers) = line
            .match_indices('_')
            .rev()
            .find_map(|(i, _)| parse_triplet(&line[i + 1..]).map(|n| (i, n)))
            .ok_or(TerminalError::Malformed)?;

        let name_sep = line[..version_sep]
            .rfind('_')
            .ok_or(TerminalError::Malformed)?;

        let field = |s: &str| String::try_from(s).map_err(|_| TerminalError::Malformed);
        let [major, minor, patch] = numbers;

        Ok(Self {
            name: field(&line[..name_sep])?,
            mcu_type: field(&line[name_sep + 1..version_sep])?,
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}.{}.{}",
            self.name, self.mcu_type, self.major, self.minor, self.patch
        )
    }
}

/// Match a leading `digits.digits.digits`.
fn parse_triplet(s: &str) -> Option<[u16; 3]> {
    let mut rest = s;
    let mut out = [0u16; 3];
    for (i, slot) in out.iter_mut().enumerate() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        *slot = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        if i < 2 {
            rest = rest.strip_prefix('.')?;
        }
    }
    Some(out)
}
