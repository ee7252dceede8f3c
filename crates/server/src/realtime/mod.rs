//! The real-time core: presence, routing and live delivery.

pub mod delivery;
pub mod handshake;
pub mod notify;
pub mod registry;
pub mod router;
pub mod verifier;

pub use delivery::MessageDelivery;
pub use handshake::{extract_credential, Session, SessionManager};
pub use notify::Notifier;
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, EventSender, OnlineEntry, TypingEntry};
pub use router::{audience_for, EventRouter};
pub use verifier::{IdentityVerifier, JwtVerifier, VerifiedIdentity, VerifyError};
