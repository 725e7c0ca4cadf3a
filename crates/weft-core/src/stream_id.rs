//! Stream id allocation.
//!
//! Each side of a connection draws from its own parity: the client uses odd
//! ids (1, 3, 5, ...), the server even ids (2, 4, 6, ...). Ids wrap at 2^31
//! preserving parity; id 0 is reserved for connection-level frames and is
//! never produced. The allocator probes forward past ids that are still live
//! in the stream table.

use std::collections::HashMap;

use crate::frame::MAX_STREAM_ID;

#[derive(Debug)]
pub struct StreamIdSupplier {
    next: u64,
}

impl StreamIdSupplier {
    /// Odd ids, for the connection initiator.
    pub fn client() -> Self {
        Self { next: 1 }
    }

    /// Even ids, for the connection acceptor.
    pub fn server() -> Self {
        Self { next: 2 }
    }

    /// The next free id. Must be called under the same lock that guards
    /// `in_use`, so allocation and table insertion are one critical section.
    pub(crate) fn next_id<V>(&mut self, in_use: &HashMap<u32, V>) -> u32 {
        loop {
            let id = (self.next & u64::from(MAX_STREAM_ID)) as u32;
            self.next += 2;
            if id != 0 && !in_use.contains_key(&id) {
                return id;
            }
        }
    }
}
