pub mod listener;

pub use listener::{Decoded, dispatch, start_ring_listener};
