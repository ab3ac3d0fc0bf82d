/// Per-call context, passed by value from the dispatcher into handlers and
/// from handlers into outbound peer calls.
///
/// `identity` is the logical actor the call runs for (0 when there is none)
/// and `sequence_number` is the sequence of the inbound request that started
/// the work (0 for fire-and-forget and background work).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CallContext {
    pub identity: i64,
    pub sequence_number: i64,
}

impl CallContext {
    pub fn new(identity: i64, sequence_number: i64) -> Self {
        Self {
            identity,
            sequence_number,
        }
    }

    /// Context for work that was not started by an inbound request.
    pub fn for_identity(identity: i64) -> Self {
        Self::new(identity, 0)
    }

    pub fn has_identity(&self) -> bool {
        self.identity > 0
    }

    /// Whether the originating caller waits for a response.
    pub fn expects_response(&self) -> bool {
        self.sequence_number != 0
    }
}
