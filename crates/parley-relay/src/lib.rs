pub mod connection;
pub mod directory;
pub mod router;
