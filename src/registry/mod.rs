//! Session registry
//!
//! The registry owns every peer's state: transports, producers, consumers,
//! the recording process and the ports leased for it. It is passed around as
//! `Arc<SessionRegistry>`; there is no global map.
//!
//! # Architecture
//!
//! ```text
//!                       Arc<SessionRegistry>
//!                  ┌────────────────────────────┐
//!                  │ peers: HashMap<SessionId,  │
//!                  │   Mutex<Peer {             │
//!                  │     transports, producers, │
//!                  │     consumers, process,    │
//!                  │     ports,                 │
//!                  │   }>                       │
//!                  │ >                          │
//!                  │ ports: Arc<PortAllocator>  │
//!                  └─────────────┬──────────────┘
//!                                │
//!          ┌─────────────────────┼─────────────────────┐
//!          ▼                     ▼                     ▼
//!     [connection]          [connection]          [settle task]
//!     handle_message()      destroy_peer()        recording_consumers()
//! ```
//!
//! Teardown is idempotent: the peer is removed from the map before its
//! resources are released, so a second `destroy_peer` finds nothing.

pub mod entry;
pub mod error;
pub mod id;
pub mod store;

pub use entry::{Peer, PeerTeardown, RecordingTeardown, SessionPhase};
pub use error::RegistryError;
pub use id::SessionId;
pub use store::SessionRegistry;
