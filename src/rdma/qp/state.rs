use std::fmt;

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QpState {
    /// Reset.
    Reset = 0,

    /// Initialized.
    Init = 1,

    /// Ready To Receive.
    Rtr = 2,

    /// Ready To Send.
    Rts = 3,

    /// Send Queue Drain.
    Sqd = 4,

    /// Send Queue Error.
    Sqe = 5,

    /// Error.
    Error = 6,
}

impl QpState {
    /// The state a connection-establishment transition into `self` must start
    /// from, or `None` if `self` is not reached by connection establishment.
    pub fn predecessor(self) -> Option<QpState> {
        match self {
            QpState::Init => Some(QpState::Reset),
            QpState::Rtr => Some(QpState::Init),
            QpState::Rts => Some(QpState::Rtr),
            _ => None,
        }
    }
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::Rtr => "RTR",
            QpState::Rts => "RTS",
            QpState::Sqd => "SQD",
            QpState::Sqe => "SQE",
            QpState::Error => "ERR",
        })
    }
}
