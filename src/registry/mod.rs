pub mod connections;
pub mod rooms;
