use protocol::ProtocolError;

/// Errors raised while building or decoding file lists.
#[derive(Debug, thiserror::Error)]
pub enum FlistError {
    /// A principal name was empty or longer than 255 bytes.
    #[error("principal name of {0} bytes is out of range")]
    PrincipalName(usize),

    /// A principal id did not fit the 16-bit wire range.
    #[error("principal id {0} is out of range")]
    PrincipalId(u32),

    /// A path name byte string violated an invariant.
    #[error("invalid path name: {0}")]
    BadName(&'static str),

    /// A decoded entry contradicted itself.
    #[error("inconsistent file entry: {0}")]
    BadEntry(&'static str),

    /// The underlying codec failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
