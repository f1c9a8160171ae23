use crate::{
    commands::basic::EraseAppSettings, connection::ExecuteError, upgrade::BasicClient,
};

use super::{SharedConnection, lock_connection};

/// Blocking client for the Zephyr basic management group.
pub struct BasicManager {
    connection: SharedConnection,
}

impl BasicManager {
    /// Creates a manager on a shared connection.
    pub fn new(connection: SharedConnection) -> Self {
        Self { connection }
    }
}

impl BasicClient for BasicManager {
    fn erase_app_settings(&self) -> Result<(), ExecuteError> {
        lock_connection(&self.connection)
            .execute_command(&EraseAppSettings)
            .map(|_| ())
    }
}
