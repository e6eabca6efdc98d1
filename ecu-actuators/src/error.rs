use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidChannel,
    InvalidCarrier,
    InvalidConfiguration,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidChannel => write!(f, "PWM channel is not configured"),
            Error::InvalidCarrier => write!(f, "Carrier frequency does not fit the timer tick rate"),
            Error::InvalidConfiguration => write!(f, "Invalid configuration"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
