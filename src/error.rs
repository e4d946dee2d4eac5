use snafu::Snafu;

/// Everything that can go wrong inside a session. Protocol violations and
/// authentication failures terminate the offending connection; the other
/// kinds surface to the caller that issued the operation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("protocol violation: {detail}"))]
    Protocol { detail: String },

    #[snafu(display("authentication failed"))]
    Auth,

    #[snafu(display("used up client site ids"))]
    SitesExhausted,

    #[snafu(display("unknown buffer {name:?}"))]
    UnknownBuffer { name: String },

    #[snafu(display("operation requires the {role} role"))]
    WrongRole { role: &'static str },

    #[snafu(display("position {pos} out of range (buffer holds {len})"))]
    OutOfRange { pos: usize, len: usize },

    #[snafu(display("buffer {name:?} is already shared"))]
    AlreadyShared { name: String },

    #[snafu(display("session has shut down"))]
    SessionClosed,

    #[snafu(display("bad config: {detail}"))]
    BadConfig { detail: String },

    #[snafu(context(false), display("{source}"))]
    Io { source: std::io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
