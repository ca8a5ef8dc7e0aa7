//! Credit accounting for the network-to-application direction of a
//! connection. Owns no I/O; [`crate::connection::Connection`] drives the
//! actual socket reads and calls back into this bookkeeping.

#[derive(Debug)]
pub struct ReadStream {
    pub stream_id: u64,
    /// Remaining credit, in bytes. `-1` is the EOF sentinel.
    readable_bytes: i64,
    read_padding: u16,
    read_group_id: u64,
    /// Latched when a RESET is owed to a throttle target that has not yet
    /// been correlated.
    reset_required: bool,
}

impl ReadStream {
    pub fn new(stream_id: u64) -> Self {
        Self { stream_id, readable_bytes: 0, read_padding: 0, read_group_id: 0, reset_required: false }
    }

    pub fn is_eof(&self) -> bool {
        self.readable_bytes < 0
    }

    pub fn group_id(&self) -> u64 {
        self.read_group_id
    }

    pub fn padding(&self) -> u16 {
        self.read_padding
    }

    /// Applies a WINDOW grant from the consumer.
    pub fn grant_window(&mut self, credit: i32, padding: i32, group_id: u64) {
        if self.is_eof() {
            return;
        }
        self.readable_bytes = self.readable_bytes.saturating_add(i64::from(credit));
        self.read_padding = padding.max(0) as u16;
        self.read_group_id = group_id;
    }

    /// Bytes currently available to read from the socket, after reserving
    /// `read_padding` per the invariant that a DATA frame is only emitted
    /// when at least `padding + 1` bytes of credit remain.
    pub fn available_to_read(&self) -> usize {
        if self.is_eof() {
            return 0;
        }
        (self.readable_bytes - i64::from(self.read_padding)).max(0) as usize
    }

    /// Called after dispatching a DATA frame of `bytes_read` payload bytes.
    pub fn on_data_dispatched(&mut self, bytes_read: usize) {
        let spent = bytes_read as i64 + i64::from(self.read_padding);
        self.readable_bytes = (self.readable_bytes - spent).max(0);
    }

    /// Orderly remote half-close.
    pub fn on_eof(&mut self) {
        self.readable_bytes = -1;
    }

    /// Abortive close: latch RESET if not yet correlated, else the caller
    /// sends RESET immediately and should not latch.
    pub fn latch_reset_required(&mut self) {
        self.reset_required = true;
    }

    pub fn take_reset_required(&mut self) -> bool {
        std::mem::take(&mut self.reset_required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_accumulate_and_respect_padding() {
        let mut rs = ReadStream::new(1);
        rs.grant_window(100, 10, 0);
        assert_eq!(rs.available_to_read(), 90);
    }

    #[test]
    fn dispatch_consumes_payload_and_padding() {
        let mut rs = ReadStream::new(1);
        rs.grant_window(100, 10, 0);
        rs.on_data_dispatched(50);
        assert_eq!(rs.available_to_read(), 40 - 10);
    }

    #[test]
    fn eof_sentinel_blocks_further_reads() {
        let mut rs = ReadStream::new(1);
        rs.grant_window(100, 0, 0);
        rs.on_eof();
        assert!(rs.is_eof());
        assert_eq!(rs.available_to_read(), 0);
        rs.grant_window(50, 0, 0);
        assert!(rs.is_eof(), "window grants after EOF must not resurrect the stream");
    }

    #[test]
    fn reset_required_latch_is_one_shot() {
        let mut rs = ReadStream::new(1);
        assert!(!rs.take_reset_required());
        rs.latch_reset_required();
        assert!(rs.take_reset_required());
        assert!(!rs.take_reset_required());
    }
}
