pub mod persistent;

pub use persistent::{
    PersistentStream, PersistentStreamHandler, PersistentStreamState, StreamSettings, DEFAULT_IDLE_TIMEOUT,
};
