#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation, // TODO
    clippy::too_many_lines, // TODO
)]

mod body;
mod config;
mod connection;
mod error;
mod frame;
mod handler;
mod hpack;
mod io;
mod scheduler;
mod settings;
mod stream;
mod types;

pub use bytes::Bytes;

pub use body::BodyBuffer;
pub use config::Config;
pub use connection::{Connection, FrameDecoder, FrameEncoder};
pub use error::{ApplicationError, ConnectionError, Reason, StreamError};
pub use frame::{
    ContinuationFlags, DataFlags, Frame, FrameType, HeadersFlags, PingFlags, Priority,
    PushPromiseFlags, SettingsFlags,
};
pub use handler::{
    default_error_handler, ErrorHandler, PushError, RequestHandler, ResponseWriter, StreamErrorContext,
    StreamHandle,
};
pub use io::{ReadOperation, WriteOperation, WriteResult};
pub use settings::SettingsParameter;
pub use types::{Headers, StreamId};
