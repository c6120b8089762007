pub mod controller;
pub mod document;
pub mod events;
pub mod negotiator;
pub mod session;
pub mod stitcher;
pub mod synthesis;
pub mod tts;
