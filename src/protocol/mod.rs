//! Wire protocol: subjects, framing, encoding and fragmentation

pub mod constants;
pub mod encoder;
pub mod fragment;
pub mod message;
pub mod parser;
pub mod subject;

pub use fragment::{Fragmenter, Reassembler, Trailer};
pub use message::{ConnectOptions, Frame, ServerInfo};
pub use parser::FrameParser;
pub use subject::Subject;
