mod basic;
mod default;
mod image;

pub use basic::BasicManager;
pub use default::DefaultManager;
pub use image::ImageManager;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::Connection;

/// The connection handle shared by the command-group managers.
///
/// SMP allows a single in-flight request per connection, so the managers
/// serialize their exchanges through this mutex.
pub type SharedConnection = Arc<Mutex<Connection>>;

pub(crate) fn lock_connection(connection: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    // a poisoned connection is still structurally intact, the next
    // request/response pair resynchronizes by sequence number
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}
