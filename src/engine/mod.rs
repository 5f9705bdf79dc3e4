pub mod alerts;
pub mod capabilities;
pub mod connection;
pub mod events;
pub mod preferences;
pub mod reconciler;
pub mod registry;
pub mod rooms;
pub mod session;
pub mod signals;
pub mod upload;
