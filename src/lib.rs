//! Emu Sound Sync Library
//!
//! Audio output synchronization for real-time emulators.

pub mod audio;
pub mod clock;
pub mod engine;
pub mod error;
pub mod sim;
