pub mod config;
pub mod error;
pub mod packet;
pub mod robot;
pub mod transport;
pub mod types;


// Re-export the Robot facade for easy access
pub use robot::Robot;
