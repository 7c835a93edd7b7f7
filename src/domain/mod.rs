pub mod health;
pub mod heartbeat;
pub mod reconciler;
pub mod state;
pub mod types;
pub mod updater;
