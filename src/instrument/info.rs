//! The `*IDN?` identification of an instrument.
use std::fmt::Display;

use crate::InstrumentError;

/// The information an instrument reports about itself.
#[derive(serde::Serialize, Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// The human-readable name of the manufacturer
    pub manufacturer: String,
    /// The model of the instrument, without a leading `MODEL `
    pub model: String,
    /// The serial number of the instrument
    pub serial_number: String,
    /// The firmware revision of the instrument
    pub firmware_rev: String,
}

impl TryFrom<&[u8]> for Identity {
    type Error = InstrumentError;

    fn try_from(idn: &[u8]) -> std::result::Result<Self, Self::Error> {
        let idn = idn
            .iter()
            .position(|&e| e == b'\0')
            .map_or(idn, |first_null| &idn[..first_null]);

        // Prompts or echoes may surround the reply, so take the first line that
        // has the four comma separated fields.
        for line in idn.split(|c| *c == b'\n') {
            let parts: Vec<&[u8]> = line.trim_ascii().split(|c| *c == b',').collect();

            let &[m, model, s, f] = &parts[..] else {
                continue;
            };

            let field = |bytes: &[u8]| String::from_utf8_lossy(bytes).trim().to_string();
            let model = field(model);
            let model = model
                .strip_prefix("MODEL ")
                .or_else(|| model.strip_prefix("Model "))
                .map_or_else(|| model.clone(), |rest| rest.trim().to_string());

            return Ok(Self {
                manufacturer: field(m),
                model,
                serial_number: field(s),
                firmware_rev: field(f),
            });
        }
        Err(InstrumentError::BadProtocol {
            details: format!(
                "unable to parse instrument identification from {:?}",
                String::from_utf8_lossy(idn)
            ),
        })
    }
}

impl TryFrom<&str> for Identity {
    type Error = InstrumentError;

    fn try_from(idn: &str) -> std::result::Result<Self, Self::Error> {
        idn.as_bytes().try_into()
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.manufacturer, self.model, self.serial_number, self.firmware_rev
        )
    }
}
