pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod events;
pub mod frame;
pub mod logging;
pub mod negotiation;
pub mod receiver;
pub mod rtc;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transfer;
pub mod wsproto;
