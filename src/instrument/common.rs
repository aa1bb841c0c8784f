//! IEEE 488.2 common commands: operation-complete polling, self test and the
//! status registers.

use std::time::Duration;

use tracing::{debug, instrument, trace, warn};

use crate::{
    config::PollConfig,
    convert::convert_to,
    error::Result,
    instrument::Identity,
    interface::{Session, Transport},
    protocol::stb::{EventStatus, StatusByte},
    InstrumentError,
};

/// Common commands sent over a [`Session`]. Every command is newline
/// terminated and every query is answered by a single ASCII number.
///
/// The polling loops ([`CommonCommands::wait_for_operation_complete`] and
/// [`CommonCommands::self_test`]) never give up on their own unless
/// [`PollConfig::max_polls`] is set.
#[derive(Debug)]
pub struct CommonCommands<T: Transport> {
    session: Session<T>,
    poll: PollConfig,
}

impl<T: Transport> CommonCommands<T> {
    #[must_use]
    pub fn new(session: Session<T>) -> Self {
        Self::with_config(session, PollConfig::default())
    }

    #[must_use]
    pub const fn with_config(session: Session<T>, poll: PollConfig) -> Self {
        Self { session, poll }
    }

    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    #[must_use]
    pub fn into_inner(self) -> Session<T> {
        self.session
    }

    fn command(&mut self, command: &str) -> Result<()> {
        trace!("sending {command:?}");
        self.session.write(&format!("{command}\n"))?;
        Ok(())
    }

    fn query_u8(&mut self, query: &str) -> Result<u8> {
        let reply = self
            .session
            .query(&format!("{query}\n"), self.poll.timeout())?;
        trace!("{query} -> {reply:?}");
        convert_to::<u8>(&reply)
    }

    fn check_poll_limit(&self, polls: u32, what: &str) -> Result<()> {
        match self.poll.max_polls {
            Some(max) if polls >= max => {
                warn!("{what} not done after {polls} polls");
                Err(InstrumentError::Timeout {
                    details: format!("{what} not done after {polls} polls"),
                })
            }
            _ => Ok(()),
        }
    }

    /// `*OPC?`: `true` once all pending operations have finished.
    ///
    /// # Errors
    /// Any transport error or a [`InstrumentError::ConversionError`] if the
    /// reply is not a number.
    pub fn get_operation_complete(&mut self) -> Result<bool> {
        Ok(self.query_u8("*OPC?")? != 0)
    }

    /// Poll `*OPC?` until it reports completion, sleeping `interval` between
    /// polls. Returns the number of polls it took.
    ///
    /// # Errors
    /// - [`InstrumentError::Timeout`] if [`PollConfig::max_polls`] is set and
    ///   exhausted
    /// - Any error of [`CommonCommands::get_operation_complete`]
    #[instrument(skip(self))]
    pub fn wait_for_operation_complete(&mut self, interval: Duration) -> Result<u32> {
        let mut polls: u32 = 0;
        loop {
            polls = polls.saturating_add(1);
            if self.get_operation_complete()? {
                debug!("operation complete after {polls} polls");
                return Ok(polls);
            }
            self.check_poll_limit(polls, "operation")?;
            std::thread::sleep(interval);
        }
    }

    /// [`CommonCommands::wait_for_operation_complete`] with the configured
    /// [`PollConfig::interval_ms`].
    ///
    /// # Errors
    /// See [`CommonCommands::wait_for_operation_complete`].
    pub fn wait(&mut self) -> Result<u32> {
        self.wait_for_operation_complete(self.poll.interval())
    }

    /// `*TST?`: run the instrument self test and wait for its result.
    /// `0` is a pass.
    ///
    /// # Errors
    /// - [`InstrumentError::Timeout`] if [`PollConfig::max_polls`] is set and no
    ///   result arrived within that many reads
    /// - [`InstrumentError::ConversionError`] if the result is not a number
    /// - Any transport error
    #[instrument(skip(self))]
    pub fn self_test(&mut self) -> Result<bool> {
        self.command("*TST?")?;
        let mut polls: u32 = 0;
        let reply = loop {
            polls = polls.saturating_add(1);
            let reply = self.session.read(self.poll.timeout())?;
            if !reply.trim().is_empty() {
                break reply;
            }
            self.check_poll_limit(polls, "self test")?;
        };
        let result = convert_to::<u8>(&reply)?;
        debug!("self test result {result}");
        Ok(result == 0)
    }

    /// `*ESE?`
    ///
    /// # Errors
    /// Any transport or conversion error.
    pub fn get_event_status_enable(&mut self) -> Result<u8> {
        self.query_u8("*ESE?")
    }

    /// `*ESE <mask>`
    ///
    /// # Errors
    /// Any transport error.
    pub fn set_event_status_enable(&mut self, mask: u8) -> Result<()> {
        self.command(&format!("*ESE {mask}"))
    }

    /// `*ESR?`. The instrument clears the register when it is read.
    ///
    /// # Errors
    /// Any transport or conversion error.
    pub fn get_event_status_register(&mut self) -> Result<u8> {
        self.query_u8("*ESR?")
    }

    /// `*SRE?`
    ///
    /// # Errors
    /// Any transport or conversion error.
    pub fn get_service_request_enable(&mut self) -> Result<u8> {
        self.query_u8("*SRE?")
    }

    /// `*SRE <mask>`
    ///
    /// # Errors
    /// Any transport error.
    pub fn set_service_request_enable(&mut self, mask: u8) -> Result<()> {
        self.command(&format!("*SRE {mask}"))
    }

    /// `*STB?`
    ///
    /// # Errors
    /// Any transport or conversion error.
    pub fn get_status_byte(&mut self) -> Result<u8> {
        self.query_u8("*STB?")
    }

    /// [`CommonCommands::get_status_byte`] as a bit view.
    ///
    /// # Errors
    /// Any transport or conversion error.
    pub fn status_byte(&mut self) -> Result<StatusByte> {
        self.get_status_byte().map(StatusByte)
    }

    /// [`CommonCommands::get_event_status_register`] as a bit view.
    ///
    /// # Errors
    /// Any transport or conversion error.
    pub fn event_status(&mut self) -> Result<EventStatus> {
        self.get_event_status_register().map(EventStatus)
    }

    /// `*CLS`
    ///
    /// # Errors
    /// Any transport error.
    pub fn clear_status(&mut self) -> Result<()> {
        self.command("*CLS")
    }

    /// `*RST`
    ///
    /// # Errors
    /// Any transport error.
    pub fn reset(&mut self) -> Result<()> {
        self.command("*RST")
    }

    /// `*TRG`
    ///
    /// # Errors
    /// Any transport error.
    pub fn trigger(&mut self) -> Result<()> {
        self.command("*TRG")
    }

    /// `*IDN?`, waiting for the complete line.
    ///
    /// # Errors
    /// - [`InstrumentError::Timeout`] if no complete line arrives in time
    /// - [`InstrumentError::BadProtocol`] if the reply is not an identification
    /// - Any transport error
    #[instrument(skip(self))]
    pub fn identify(&mut self) -> Result<Identity> {
        self.command("*IDN?")?;
        let scan = self.session.read_until("\n", self.poll.timeout())?;
        let identity = Identity::try_from(scan.before_delimiter())?;
        debug!("identified {identity}");
        Ok(identity)
    }
}
