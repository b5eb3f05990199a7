//! Process exit codes.
//!
//! The subset of upstream rsync's `errcode.h` this implementation can
//! actually produce. Every error path maps onto one of these before the
//! process ends, so scripted callers see the same codes a stock rsync
//! would give them.

use std::fmt;

/// Exit codes returned by the binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful completion.
    Ok = 0,

    /// Syntax or usage error: bad flags, bad URLs, two remote endpoints.
    Syntax = 1,

    /// Error starting the client-server protocol: authentication failed,
    /// unknown module, daemon refused the session.
    StartClient = 5,

    /// Protocol or transport error: bad framing, timeouts, lost peers.
    SocketIo = 10,

    /// The session completed but some files failed.
    PartialTransfer = 23,
}

impl ExitCode {
    /// Numeric process exit value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Human-readable summary, matching upstream's `log.c` strings.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Ok => "success",
            Self::Syntax => "syntax or usage error",
            Self::StartClient => "error starting client-server protocol",
            Self::SocketIo => "error in socket IO",
            Self::PartialTransfer => "some files could not be transferred",
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_i32(), self.description())
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.as_i32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_match_upstream() {
        assert_eq!(ExitCode::Ok.as_i32(), 0);
        assert_eq!(ExitCode::Syntax.as_i32(), 1);
        assert_eq!(ExitCode::StartClient.as_i32(), 5);
        assert_eq!(ExitCode::SocketIo.as_i32(), 10);
        assert_eq!(ExitCode::PartialTransfer.as_i32(), 23);
    }

    #[test]
    fn display_carries_the_description() {
        assert_eq!(
            ExitCode::PartialTransfer.to_string(),
            "23 (some files could not be transferred)"
        );
    }
}
