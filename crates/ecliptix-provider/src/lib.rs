pub mod connectivity;
pub mod events;
pub mod failure;
pub mod handshake;
pub mod observer;
pub mod outage;
pub mod pending;
pub mod pinning;
pub mod provider;
pub mod retry;
pub mod session;
pub mod settings;
pub mod storage;
pub mod transport;

pub use connectivity::{
    ConnectivityHub, ConnectivityIntent, ConnectivitySnapshot, ConnectivityStatus, StatusSource,
};
pub use events::ProtocolEvents;
pub use failure::{NetworkFailure, NetworkFailureKind, UserError};
pub use observer::ConnectivityObserver;
pub use pending::PendingRequestManager;
pub use pinning::CertificatePinning;
pub use provider::{NetworkProvider, RestoreMode};
pub use retry::{RetryPolicy, RetryStrategy};
pub use session::{derive_connect_id, Session, SessionCatalog};
pub use settings::{
    ApplicationInstanceSettings, DEFAULT_CULTURE_CODE, FAILURE_POLLING_INTERVAL,
    NETWORK_CHANGE_THROTTLE, OUTAGE_RECOVERY_TIMEOUT,
};
pub use storage::{session_key, timestamp_key, SecureStore, StorageError};
pub use transport::{
    EnvelopeStream, RpcRequestContext, RpcTransport, ServiceType, TransportError,
};
