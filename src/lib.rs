pub mod channel;
pub mod config;
pub mod io;
pub mod logger;
pub mod session;
