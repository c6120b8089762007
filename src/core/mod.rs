pub mod config;
pub mod error;
pub mod io;
pub mod script;
pub mod segmenter;
pub mod state;
pub mod voices;
