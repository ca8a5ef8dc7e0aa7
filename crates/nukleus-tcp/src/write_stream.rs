//! Credit accounting for the application-to-network direction of a
//! connection. Owns no I/O; [`crate::connection::Connection`] drives the
//! actual socket writes and calls back into this bookkeeping.

#[derive(Debug)]
pub struct WriteStream {
    pub stream_id: u64,
    /// Credit previously advertised to the producer via WINDOW; DATA
    /// exceeding this is an overflow.
    granted_credit: i64,
    /// Reserved overhead this worker advertises in its own WINDOW grants
    /// back to the application producer (§3, padding).
    padding: u16,
    group_id: u64,
    end_deferred: bool,
    abort_deferred: bool,
}

impl WriteStream {
    pub fn new(stream_id: u64, initial_credit: i32) -> Self {
        Self {
            stream_id,
            granted_credit: i64::from(initial_credit),
            padding: 0,
            group_id: 0,
            end_deferred: false,
            abort_deferred: false,
        }
    }

    /// Seeds `padding` from the connection's configured window padding so the
    /// first regrant already reserves it, instead of only applying once a
    /// consumer-driven WINDOW has set it.
    pub fn with_padding(stream_id: u64, initial_credit: i32, padding: u16, group_id: u64) -> Self {
        Self { padding, group_id, ..Self::new(stream_id, initial_credit) }
    }

    pub fn padding(&self) -> i32 {
        i32::from(self.padding)
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    /// Checks an incoming DATA payload against outstanding credit. Returns
    /// `false` on overflow; the caller must then RESET the direction and
    /// increment the overflow counter without consuming credit.
    pub fn accept(&mut self, payload_len: usize) -> bool {
        if payload_len as i64 > self.granted_credit {
            return false;
        }
        self.granted_credit -= payload_len as i64;
        true
    }

    /// Called once `n` bytes have actually been handed to the kernel (either
    /// written directly or absorbed into the backlog). Returns the WINDOW
    /// credit to grant back to the producer, including padding.
    pub fn credit_to_regrant(&mut self, n: usize, padding: i32) -> i32 {
        self.granted_credit += n as i64;
        n as i32 + padding
    }

    pub fn defer_end(&mut self) {
        self.end_deferred = true;
    }

    pub fn defer_abort(&mut self) {
        self.abort_deferred = true;
    }

    pub fn take_deferred_end(&mut self) -> bool {
        std::mem::take(&mut self.end_deferred)
    }

    pub fn take_deferred_abort(&mut self) -> bool {
        std::mem::take(&mut self.abort_deferred)
    }
}
