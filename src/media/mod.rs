//! Media decoding: demand-driven players and raw stream wrappers

pub mod player;
pub mod stream;

pub use player::{LoopMode, MediaInfo, MediaPlayer, PlayerState};
pub use stream::GstStream;
