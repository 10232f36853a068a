//! Text rendering of node events and command-line value parsing.

use anyhow::{bail, Context};
use bluest_core::Event;

/// One log line for `event`.
pub fn describe(event: &Event) -> String {
    match event {
        Event::FeatureDiscovered {
            feature,
            name,
            unit,
        } => format!(
            "feature {name} [{unit}] on {:?} (mask {:#010x})",
            feature.channel, feature.mask
        ),
        Event::ValueUpdated { feature, value } => {
            format!("{:?}/{:#010x}: {value}", feature.channel, feature.mask)
        }
        Event::TransferProgress(progress) => format!(
            "flashed {} / {} bytes ({:.0}%)",
            progress.bytes_sent,
            progress.total,
            progress.fraction() * 100.0
        ),
        Event::TransferCompleted => "upgrade complete, node rebooting".to_string(),
        Event::TransferFailed(e) => format!("upgrade failed: {e}"),
        Event::VersionReported(version) => format!(
            "firmware {} on {} v{}.{}.{}",
            version.name, version.mcu_type, version.major, version.minor, version.patch
        ),
        Event::StatusMessage(text) => format!("node: {text}"),
    }
}

/// Parse a hex byte string such as `"0000fa00"` or `"00 00 fa 00"`.
pub fn parse_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits in {text:?}");
    }
    digits
        .chunks_exact(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).context("payload is not ASCII")?;
            u8::from_str_radix(pair, 16).with_context(|| format!("bad hex byte {pair:?}"))
        })
        .collect()
}

/// Parse a feature mask given as `0x001C0000` or decimal.
pub fn parse_mask_arg(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid mask {text:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluest_core::transfer::Progress;
    use bluest_core::{CharacteristicId, FeatureRef};
    use bluest_proto::Reading;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0000fa00").unwrap(), [0, 0, 0xFA, 0]);
        assert_eq!(parse_hex("00 00:FA 00").unwrap(), [0, 0, 0xFA, 0]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_mask_arg() {
        assert_eq!(parse_mask_arg("0x001C_0000"), Ok(0x001C_0000));
        assert_eq!(parse_mask_arg("262144"), Ok(0x0004_0000));
        assert!(parse_mask_arg("0xnope").is_err());
    }

    #[test]
    fn test_describe() {
        let value = Event::ValueUpdated {
            feature: FeatureRef {
                channel: CharacteristicId(0x13),
                mask: 0x0004_0000,
            },
            value: Reading::Scalar(77.0),
        };
        assert!(describe(&value).starts_with("CharacteristicId(19)/0x00040000: "));

        let progress = Event::TransferProgress(Progress {
            bytes_sent: 160,
            packets_sent: 10,
            total: 320,
        });
        assert_eq!(describe(&progress), "flashed 160 / 320 bytes (50%)");
    }
}
