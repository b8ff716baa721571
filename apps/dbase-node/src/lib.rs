//! Peer-to-peer record replication over WebRTC data channels.
//!
//! Peers find each other through a websocket relay, negotiate a data channel
//! and exchange key/value records split into checksummed frames.

pub mod config;
pub mod logging;
pub mod protocol;
pub mod storage;
pub mod transfer;
pub mod transport;
