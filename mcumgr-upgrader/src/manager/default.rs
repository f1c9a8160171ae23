use crate::{
    commands::os::{McuMgrParameters, McuMgrParametersResponse, SystemReset},
    connection::ExecuteError,
    upgrade::DefaultClient,
};

use super::{SharedConnection, lock_connection};

/// Blocking client for the default/OS management group.
pub struct DefaultManager {
    connection: SharedConnection,
}

impl DefaultManager {
    /// Creates a manager on a shared connection.
    pub fn new(connection: SharedConnection) -> Self {
        Self { connection }
    }
}

impl DefaultClient for DefaultManager {
    fn params(&self) -> Result<McuMgrParametersResponse, ExecuteError> {
        lock_connection(&self.connection).execute_command(&McuMgrParameters)
    }

    fn reset(&self) -> Result<(), ExecuteError> {
        lock_connection(&self.connection)
            .execute_command(&SystemReset {
                force: false,
                boot_mode: None,
            })
            .map(|_| ())
    }
}
