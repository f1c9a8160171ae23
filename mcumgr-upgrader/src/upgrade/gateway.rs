/// Connection state of the transport carrying the management traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The device is reachable.
    Connected,
    /// The device dropped the connection (or was never connected).
    Disconnected,
}

/// Result of a [`TransportGateway::connect`] attempt.
#[derive(Debug)]
pub enum ConnectOutcome {
    /// The connection is established.
    Connected,
    /// The transport will connect on its own; a later
    /// [`ConnectionState::Connected`] observer event reports completion.
    Deferred,
    /// The connection attempt failed.
    Failed(std::io::Error),
}

/// Callback invoked on every connection state change.
pub type ConnectionObserver = Box<dyn FnMut(ConnectionState) + Send>;

/// Token identifying a registered [`ConnectionObserver`].
pub type ObserverId = u64;

/// The transport seam the upgrade orchestrator observes around a device
/// reset.
///
/// The orchestrator registers an observer before rebooting the device,
/// waits for the disconnect, and calls [`connect`](Self::connect) again
/// once the swap should be over.
pub trait TransportGateway: Send + Sync {
    /// Initiates a connection to the device.
    fn connect(&self) -> ConnectOutcome;

    /// Registers an observer for connection state changes.
    fn add_observer(&self, observer: ConnectionObserver) -> ObserverId;

    /// Removes a previously registered observer.
    fn remove_observer(&self, id: ObserverId);
}
