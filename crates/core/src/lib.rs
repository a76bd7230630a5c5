//! Engine for real-time voice conversations with a streaming audio model.
//!
//! The crate is provider and hardware neutral. A [`transport::Connector`]
//! opens the connection and an [`session::AudioBackend`] supplies devices;
//! [`session::SessionController`] drives everything else.

pub mod capture;
pub mod codec;
pub mod error;
pub mod events;
pub mod meter;
pub mod persona;
pub mod playback;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod transport;

pub use error::EngineError;
pub use events::{ClientEvent, ServerEvent, SessionSetup};
pub use persona::{ContentRating, PersonaConfig, PromptBuilder};
pub use session::{
    AudioBackend, SessionConfig, SessionController, SessionObservers, SessionStatus,
};
pub use transport::{Connector, LinkPeer, LiveLink};
