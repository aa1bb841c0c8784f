use std::{collections::VecDeque, time::Duration};

use crate::{error::Result, interface::Transport};

/// A transport that replays canned packets, one per `read_raw` call, and
/// records everything written to it.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: VecDeque<(Duration, Vec<u8>)>,
    pub writes: Vec<Vec<u8>>,
    pub reads: usize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet delivered immediately.
    pub fn reply(mut self, packet: impl AsRef<[u8]>) -> Self {
        self.replies
            .push_back((Duration::ZERO, packet.as_ref().to_vec()));
        self
    }

    /// Queue a packet delivered after `delay`.
    pub fn reply_after(mut self, delay: Duration, packet: impl AsRef<[u8]>) -> Self {
        self.replies.push_back((delay, packet.as_ref().to_vec()));
        self
    }
}

impl Transport for ScriptedTransport {
    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        self.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn read_raw(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        self.reads = self.reads.saturating_add(1);
        let Some((delay, mut packet)) = self.replies.pop_front() else {
            return Ok(0);
        };
        std::thread::sleep(delay);
        if packet.len() > buf.len() {
            let rest = packet.split_off(buf.len());
            self.replies.push_front((Duration::ZERO, rest));
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }
}
