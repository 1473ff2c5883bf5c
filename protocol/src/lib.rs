pub mod frame;
pub mod listener;
pub mod path_safety;

pub use frame::{FrameError, FrameHeader, ProtocolTag};
pub use path_safety::{safe_join, UnsafePathError};
