//! Peer-to-peer session plumbing: the messages peers exchange, the transport
//! seam they travel over, and one peer's wiring of the game services.

mod messages;
mod peer;
mod transport;


pub use messages::{Envelope, PeerMessage};
pub use peer::{PeerSession, SessionEvent};
pub use transport::{InMemoryHub, InMemoryTransport, PeerTransport, TransportError};
