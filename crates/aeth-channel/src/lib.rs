pub mod client;
pub mod framing;
pub mod listener;
pub mod protocol;
pub mod transport;

pub use client::{ChannelClient, StreamChunk};
pub use listener::Listener;
pub use transport::Transport;
