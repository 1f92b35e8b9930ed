pub mod autoplay;
pub mod backend;
pub mod cli;
pub mod config;
pub mod episode;
pub mod notify;
pub mod player;
pub mod playlist;
pub mod store;
pub mod stream;
