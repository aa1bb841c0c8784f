//! Bit views of the IEEE 488.2 status byte and standard event status register.

const fn is_bit_set(value: u8, bit: u8) -> bool {
    if bit > 7 {
        return false;
    }

    ((value >> bit) & 0x01) == 1
}

/// The status byte as returned by `*STB?`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct StatusByte(pub u8);

impl StatusByte {
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check to see if the EAV bit is set
    #[must_use]
    pub const fn error_available(self) -> bool {
        is_bit_set(self.0, 2)
    }

    /// Check to see if the QSB bit is set
    #[must_use]
    pub const fn questionable_summary(self) -> bool {
        is_bit_set(self.0, 3)
    }

    /// Check to see if the MAV bit is set
    #[must_use]
    pub const fn message_available(self) -> bool {
        is_bit_set(self.0, 4)
    }

    /// Check to see if the ESB bit is set
    #[must_use]
    pub const fn event_summary(self) -> bool {
        is_bit_set(self.0, 5)
    }

    /// Check to see if the MSS/RQS bit is set
    #[must_use]
    pub const fn request_service(self) -> bool {
        is_bit_set(self.0, 6)
    }

    /// Check to see if the OSB bit is set
    #[must_use]
    pub const fn operation_summary(self) -> bool {
        is_bit_set(self.0, 7)
    }
}

impl From<u8> for StatusByte {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// The standard event status register as returned by `*ESR?`. Reading it on
/// the instrument clears it.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EventStatus(pub u8);

impl EventStatus {
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn operation_complete(self) -> bool {
        is_bit_set(self.0, 0)
    }

    #[must_use]
    pub const fn request_control(self) -> bool {
        is_bit_set(self.0, 1)
    }

    #[must_use]
    pub const fn query_error(self) -> bool {
        is_bit_set(self.0, 2)
    }

    #[must_use]
    pub const fn device_error(self) -> bool {
        is_bit_set(self.0, 3)
    }

    #[must_use]
    pub const fn execution_error(self) -> bool {
        is_bit_set(self.0, 4)
    }

    #[must_use]
    pub const fn command_error(self) -> bool {
        is_bit_set(self.0, 5)
    }

    #[must_use]
    pub const fn user_request(self) -> bool {
        is_bit_set(self.0, 6)
    }

    #[must_use]
    pub const fn power_on(self) -> bool {
        is_bit_set(self.0, 7)
    }

    /// Any of the query, device, execution or command error bits.
    #[must_use]
    pub const fn has_error(self) -> bool {
        self.0 & 0b0011_1100 != 0
    }
}

impl From<u8> for EventStatus {
    fn from(value: u8) -> Self {
        Self(value)
    }
}
